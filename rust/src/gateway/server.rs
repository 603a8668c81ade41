// =============================================================================
// WebSocket front door: acceptor, handshake and per-connection I/O.
//
//   - Acceptor applies TCP_NODELAY + keepalive, asks the coordinator which
//     worker takes the connection and hands the stream to that worker
//   - Handshake captures the bearer token (query, Authorization, cookie) and
//     the `compression=1` flag; admission runs before anything is registered
//   - Write coalescing: feed() + batch try_recv() + single flush()
// =============================================================================

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use super::admission::{AdmissionController, AdmissionSettings, ConnectionRequest};
use super::bus::Bus;
use super::cluster::ClusterCoordinator;
use super::dispatcher::CommandDispatcher;
use super::message;
use super::redis_bus::RedisBus;
use super::registry::OutboundFrame;
use super::security::BusSigner;
use super::transport::DeviceLinks;
use super::worker::{ConnectionTeardown, Incoming, LocalWorkerSpawner, Services, Worker};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::jwt;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

const WRITE_COALESCE_MAX: usize = 64;

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
struct Handshake {
    token: Option<String>,
    compression: bool,
}

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn read_handshake(req: &Request) -> Handshake {
    let query = req.uri().query();
    let token = jwt::extract_bearer(query, header(req, "authorization"), header(req, "cookie"))
        .map(str::to_string);
    let compression = query
        .and_then(|q| jwt::parse_query_value(q, "compression"))
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    Handshake { token, compression }
}

// ---------------------------------------------------------------------------
// Per-connection I/O
// ---------------------------------------------------------------------------

/// Drain the connection's outbound channel into the socket until a `Close`
/// frame arrives or the socket fails.
async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<OutboundFrame>) {
    'outer: while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        let mut count = 0;
        let mut closing = false;
        // Coalescing: drain pending frames before one flush
        while let Some(frame) = next.take() {
            match frame {
                OutboundFrame::Text(text) => {
                    if sink.feed(Message::Text(text.into())).await.is_err() {
                        break 'outer;
                    }
                }
                OutboundFrame::Close => {
                    closing = true;
                    break;
                }
            }
            count += 1;
            if count >= WRITE_COALESCE_MAX {
                break;
            }
            next = rx.try_recv().ok();
        }
        if sink.flush().await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Full lifetime of one client connection on `worker`.
pub async fn serve_connection(worker: Arc<Worker>, stream: TcpStream, addr: SocketAddr) {
    let captured: Arc<OnceLock<Handshake>> = Arc::new(OnceLock::new());
    let slot = captured.clone();
    let ws = match tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let _ = slot.set(read_handshake(req));
            Ok(response)
        },
    )
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };
    let Handshake { token, compression } = captured.get().cloned().unwrap_or_default();

    let (sink, mut read_half) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let services = worker.services();
    let admitted = services.admission.admit(ConnectionRequest {
        token,
        source: addr.ip(),
        compression,
        outbound: tx.clone(),
    });
    let conn = match admitted {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            // refused: tell the client why, then close; nothing was registered
            tracing::warn!(%addr, code = e.code(), error = %e, "connection refused");
            let _ = tx.send(OutboundFrame::Text(message::error(&e, None).to_text()));
            let _ = tx.send(OutboundFrame::Close);
            drop(tx);
            write_loop(sink, rx).await;
            return;
        }
    };
    drop(tx);
    let writer = tokio::spawn(write_loop(sink, rx));

    if !worker.open(conn.clone()) {
        services.admission.release();
        conn.close();
        let _ = writer.await;
        return;
    }
    let teardown = ConnectionTeardown::new(worker.clone(), conn.clone());
    let _ = conn.send(&message::welcome(
        &conn.id,
        &conn.user_id,
        &conn.session_id,
        worker.id,
    ));

    while let Some(frame) = read_half.next().await {
        match frame {
            Ok(Message::Text(text)) => worker.ingest(&conn, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                let err = GatewayError::InvalidMessage("binary frames are not supported".into());
                let _ = conn.send(&message::error(&err, None));
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "read failed");
                break;
            }
        }
    }

    drop(teardown);
    let _ = writer.await;
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

fn configure_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}

/// Accept until `cancel` fires, steering each connection to a worker.
pub async fn accept_loop(
    listener: &TcpListener,
    coordinator: &ClusterCoordinator,
    spawner: &LocalWorkerSpawner,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    configure_socket(&stream);
                    let Some(worker_id) = coordinator.pick_worker(addr.ip()) else {
                        tracing::warn!(%addr, "no worker available, dropping connection");
                        continue;
                    };
                    if spawner.route(worker_id, Incoming { stream, addr }).is_err() {
                        tracing::warn!(%addr, worker_id, "worker inbox unavailable, dropping connection");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            () = cancel.cancelled() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Every service built once, plus the bound listener.
pub struct Gateway {
    services: Services,
    coordinator: Arc<ClusterCoordinator>,
    spawner: Arc<LocalWorkerSpawner>,
    listener: TcpListener,
    redis: Option<RedisBus>,
}

impl Gateway {
    pub async fn bind(config: GatewayConfig) -> Result<Self, GatewayError> {
        let config = Arc::new(config);
        let signer = config
            .cluster
            .bus
            .signing_secret
            .as_deref()
            .map(BusSigner::new);
        let instance_id = config.server.instance_id.clone();
        let (bus, redis) = match &config.cluster.bus.redis_url {
            Some(url) => {
                let (bus, redis) = RedisBus::start(url.clone(), instance_id, signer);
                (bus, Some(redis))
            }
            None => (Bus::local(instance_id, signer), None),
        };

        let links = Arc::new(DeviceLinks::new());
        let dispatcher = Arc::new(CommandDispatcher::new(links.clone(), &config.dispatcher));
        let admission = Arc::new(AdmissionController::new(
            config.jwt_config(),
            AdmissionSettings::from_config(&config),
        ));
        let services = Services {
            config: config.clone(),
            admission,
            dispatcher,
            links,
            bus: bus.clone(),
        };
        let spawner = Arc::new(LocalWorkerSpawner::new(services.clone()));
        let coordinator = Arc::new(ClusterCoordinator::new(
            bus,
            spawner.clone(),
            &config.cluster,
        ));

        let listener = TcpListener::bind(config.server.bind)
            .await
            .map_err(|e| GatewayError::Transport(format!("bind {}: {e}", config.server.bind)))?;
        Ok(Self {
            services,
            coordinator,
            spawner,
            listener,
            redis,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.listener
            .local_addr()
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    /// Start the workers and serve until `shutdown` fires, then drain.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        self.coordinator.start()?;
        let background = CancellationToken::new();
        let coordinator_task = tokio::spawn(self.coordinator.clone().run(background.clone()));
        tracing::info!(
            addr = %self.local_addr()?,
            instance_id = %self.services.bus.instance_id(),
            workers = self.services.config.cluster.workers,
            "gateway listening"
        );

        accept_loop(&self.listener, &self.coordinator, &self.spawner, &shutdown).await;
        drop(self.listener);

        let timeout = Duration::from_millis(self.services.config.server.shutdown_timeout_ms);
        let forced = self.coordinator.shutdown(timeout).await;
        background.cancel();
        let _ = coordinator_task.await;
        if let Some(redis) = self.redis {
            let dead_letters = redis.dead_letter_count();
            redis.shutdown().await;
            if dead_letters > 0 {
                tracing::warn!(dead_letters, "bus messages left unpublished");
            }
        }
        tracing::info!(forced, "gateway stopped");
        Ok(())
    }
}
