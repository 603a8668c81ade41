// Gateway binary entry point.
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wse_gateway::config::GatewayConfig;
use wse_gateway::gateway::Gateway;

fn init_tracing() {
    // RUST_LOG wins; default to "info" if unset or invalid.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = GatewayConfig::from_env_or_yaml()?;
    anyhow::ensure!(
        !config.auth.jwt_secret.is_empty(),
        "auth.jwtSecret (or WSE_GATEWAY_JWT_SECRET) must be set"
    );

    let gateway = Gateway::bind(config).await.context("bind gateway")?;
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            shutdown.cancel();
        });
    }

    gateway.serve(shutdown).await.context("serve gateway")?;
    Ok(())
}
