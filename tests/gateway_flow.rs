//! End-to-end flow over loopback: admission, ping, and a command routed from a
//! client to a device link and back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wse_gateway::config::GatewayConfig;
use wse_gateway::gateway::Gateway;
use wse_gateway::gateway::cluster::{ClusterCoordinator, WorkerStatus};
use wse_gateway::jwt::jwt_encode;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-secret";

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.bind = "127.0.0.1:0".parse().unwrap();
    config.server.shutdown_timeout_ms = 1_000;
    config.auth.jwt_secret = SECRET.into();
    config.cluster.workers = 2;
    config.cluster.health_check_interval_ms = 250;
    config.queue.batch_interval_ms = 10;
    config
}

fn token(claims: Value) -> String {
    jwt_encode(&claims, SECRET.as_bytes()).unwrap()
}

fn client_token(user: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3_600;
    token(json!({"sub": user, "exp": exp, "region": "eu"}))
}

fn device_token(device_id: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3_600;
    token(json!({"sub": device_id, "exp": exp, "role": "device", "device_id": device_id}))
}

async fn wait_online(coordinator: &ClusterCoordinator, workers: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let online = coordinator
                .workers()
                .iter()
                .filter(|w| w.status == WorkerStatus::Online)
                .count();
            if online == workers {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("workers never came online");
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let url = format!("ws://{addr}/ws{query}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Next text frame as JSON, or `None` once the server closes.
async fn next_frame(ws: &mut Client) -> Option<Value> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await
    .expect("no frame within 5s")
}

async fn next_of_type(ws: &mut Client, msg_type: &str) -> Value {
    loop {
        let frame = next_frame(ws).await.expect("connection closed");
        if frame["type"] == msg_type {
            return frame;
        }
    }
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

async fn start() -> (Running, Arc<ClusterCoordinator>) {
    let gateway = Gateway::bind(config()).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    let coordinator = gateway.coordinator().clone();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            gateway.serve(shutdown).await.unwrap();
        }
    });
    wait_online(&coordinator, 2).await;
    (
        Running {
            addr,
            shutdown,
            task,
        },
        coordinator,
    )
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("gateway did not stop")
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn welcome_then_ping_pong() {
    let (gw, _) = start().await;
    let mut ws = connect(gw.addr, &format!("?token={}", client_token("alice"))).await;

    let welcome = next_of_type(&mut ws, "welcome").await;
    assert_eq!(welcome["payload"]["userId"], "alice");
    assert!(welcome["payload"]["connectionId"].is_string());

    send(
        &mut ws,
        json!({"id": "p1", "type": "ping", "payload": {"timestamp": 1}}),
    )
    .await;
    let pong = next_of_type(&mut ws, "pong").await;
    assert_eq!(pong["payload"]["clientTimestamp"], 1);

    drop(ws);
    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_token_gets_auth_error_and_close() {
    let (gw, _) = start().await;
    let mut ws = connect(gw.addr, "?token=not-a-jwt").await;

    let err = next_frame(&mut ws).await.expect("error frame");
    assert_eq!(err["type"], "error");
    assert_eq!(err["payload"]["code"], "AUTH_FAILED");
    assert!(next_frame(&mut ws).await.is_none());

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_round_trips_through_device_link() {
    let (gw, _) = start().await;

    let mut device = connect(gw.addr, &format!("?token={}", device_token("dev-1"))).await;
    next_of_type(&mut device, "welcome").await;
    let mut client = connect(gw.addr, &format!("?token={}", client_token("bob"))).await;
    next_of_type(&mut client, "welcome").await;

    send(
        &mut client,
        json!({
            "id": "m1",
            "type": "device_command",
            "payload": {"deviceId": "dev-1", "commandId": "c1", "command": {"op": "reboot"}},
        }),
    )
    .await;

    let pushed = next_of_type(&mut device, "device_command").await;
    assert_eq!(pushed["payload"]["commandId"], "c1");
    assert_eq!(pushed["payload"]["command"]["op"], "reboot");

    send(
        &mut device,
        json!({
            "id": "r1",
            "type": "command_result",
            "payload": {"commandId": "c1", "result": {"rebooted": true}},
        }),
    )
    .await;

    let done = next_of_type(&mut client, "command_success").await;
    assert_eq!(done["payload"]["commandId"], "c1");
    assert_eq!(done["payload"]["deviceId"], "dev-1");
    assert_eq!(done["payload"]["result"]["rebooted"], true);
    assert_eq!(done["payload"]["attempts"], 1);

    drop(client);
    drop(device);
    gw.stop().await;
}
