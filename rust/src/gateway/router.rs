// Inbound message routing. The batch scheduler hands every drained (or
// critical) message to `Router::handle`; replies go straight back through the
// connection's writer channel.
//
// Client types:   ping, device_command, device_status, subscribe_device,
//                 unsubscribe_device, list_devices, join_room, leave_room
// Device links:   command_result, device_event

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use super::bus::{Bus, BusChannel, BusMessage};
use super::dispatcher::{CommandDispatcher, CommandOptions, DeviceStatus, TicketState};
use super::message::{self, Envelope, Priority};
use super::queue::MessageHandler;
use super::registry::{Connection, ConnectionRegistry};
use super::transport::DeviceLinks;
use crate::error::GatewayError;
use crate::jwt::ClientRole;

#[derive(Default)]
pub struct RouterMetrics {
    pub handled: AtomicU64,
    pub commands: AtomicU64,
    pub device_events: AtomicU64,
    pub invalid: AtomicU64,
    /// Messages for connections that closed while they sat in the queue.
    pub orphaned: AtomicU64,
}

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    links: Arc<DeviceLinks>,
    bus: Arc<Bus>,
    pub metrics: RouterMetrics,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        links: Arc<DeviceLinks>,
        bus: Arc<Bus>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            links,
            bus,
            metrics: RouterMetrics::default(),
        }
    }

    async fn route(&self, conn_id: &str, msg: Envelope) {
        let Some(conn) = self.registry.lookup(conn_id) else {
            self.metrics.orphaned.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(conn_id, msg_type = %msg.msg_type, "connection gone before dispatch");
            return;
        };
        self.metrics.handled.fetch_add(1, Ordering::Relaxed);

        let reply = match msg.msg_type.as_str() {
            "ping" => {
                let client_ts = msg
                    .payload
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .unwrap_or(msg.timestamp);
                Ok(Some(message::pong(client_ts)))
            }
            "device_command" => self.submit_command(&conn, &msg).map(|_| None),
            "device_status" => self.device_status(&msg).map(Some),
            "list_devices" => {
                let devices = serde_json::to_value(self.dispatcher.list_devices())
                    .unwrap_or_else(|_| json!([]));
                Ok(Some(message::device_list(devices)))
            }
            "subscribe_device" => required(&msg, "deviceId").map(|device_id| {
                self.registry.subscribe(&conn.id, device_id);
                Some(message::subscription_success(device_id))
            }),
            "unsubscribe_device" => required(&msg, "deviceId").map(|device_id| {
                self.registry.unsubscribe(&conn.id, device_id);
                Some(message::unsubscription_success(device_id))
            }),
            "join_room" => required(&msg, "room").map(|room| {
                conn.join_room(room);
                Some(message::room_joined(room))
            }),
            "leave_room" => required(&msg, "room").map(|room| {
                conn.leave_room(room);
                Some(message::room_left(room))
            }),
            "command_result" => self.command_result(&conn, &msg).map(|_| None),
            "device_event" => self.device_event(&conn, &msg).map(|_| None),
            other => Err(GatewayError::InvalidMessage(format!(
                "unknown message type: {other}"
            ))),
        };

        let reply = match reply {
            Ok(Some(env)) => env,
            Ok(None) => return,
            Err(e) => {
                if matches!(e, GatewayError::InvalidMessage(_)) {
                    self.metrics.invalid.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(conn_id, msg_type = %msg.msg_type, error = %e, "message rejected");
                message::error(&e, Some(&msg.id))
            }
        };
        if self.registry.send_to(&conn.id, &reply).is_err() {
            tracing::debug!(conn_id, "reply dropped, connection closed");
        }
    }

    fn command_options(&self, msg: &Envelope) -> CommandOptions {
        let payload = &msg.payload;
        let mut options = self.dispatcher.default_options();
        options.priority = payload
            .get("priority")
            .and_then(|p| serde_json::from_value::<Priority>(p.clone()).ok())
            .unwrap_or_else(|| msg.priority());
        if let Some(ms) = payload.get("timeoutMs").and_then(Value::as_u64) {
            options.timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = payload.get("maxAttempts").and_then(Value::as_u64) {
            options.retry.max_attempts = n.clamp(1, u64::from(u32::MAX)) as u32;
        }
        if let Some(queue) = payload.get("queueIfOffline").and_then(Value::as_bool) {
            options.queue_if_offline = queue;
        }
        options
    }

    /// Hand the command to the dispatcher. The outcome is pushed to the
    /// caller later; only an immediate rejection is returned here.
    fn submit_command(&self, conn: &Arc<Connection>, msg: &Envelope) -> Result<(), GatewayError> {
        let device_id = required(msg, "deviceId")?;
        let command_id = msg.payload_str("commandId").unwrap_or(&msg.id).to_string();
        let command = msg.payload.get("command").cloned().unwrap_or(Value::Null);
        let options = self.command_options(msg);

        self.metrics.commands.fetch_add(1, Ordering::Relaxed);
        let ticket = self
            .dispatcher
            .submit(device_id, &command_id, command, options)
            .inspect_err(|e| {
                tracing::debug!(conn_id = %conn.id, device_id, command_id = %command_id, error = %e, "command rejected");
            })?;

        if ticket.state == TicketState::Queued {
            let _ = conn.send(&message::command_queued(&command_id, device_id));
        }
        if msg
            .payload
            .get("tiedToConnection")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            conn.tie_command(&command_id);
        }

        let conn = conn.clone();
        tokio::spawn(async move {
            let reply = match ticket.wait().await {
                Ok(outcome) => message::command_success(
                    &outcome.command_id,
                    &outcome.device_id,
                    outcome.result,
                    outcome.attempts,
                    outcome.duration.as_millis() as u64,
                ),
                Err(e) => message::error(&e, Some(&command_id)),
            };
            if conn.send(&reply).is_err() {
                tracing::debug!(conn_id = %conn.id, command_id = %command_id, "caller left before command settled");
            }
        });
        Ok(())
    }

    fn device_status(&self, msg: &Envelope) -> Result<Envelope, GatewayError> {
        let device_id = required(msg, "deviceId")?;
        let status = self
            .dispatcher
            .device_status(device_id)
            .unwrap_or_else(|| DeviceStatus {
                device_id: device_id.to_string(),
                online: false,
                executing: 0,
                queued: 0,
            });
        let mut status = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
        status["linked"] = json!(self.links.is_linked(device_id));
        Ok(message::device_status(device_id, status))
    }

    /// A device link answering one of its commands.
    fn command_result(&self, conn: &Connection, msg: &Envelope) -> Result<(), GatewayError> {
        let device_id = link_device(conn)?;
        let command_id = required(msg, "commandId")?;
        let success = msg
            .payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let reply = if success {
            Ok(msg.payload.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let reason = msg.payload_str("error").unwrap_or("device reported failure");
            Err(GatewayError::Transport(reason.to_string()))
        };
        self.links.resolve(device_id, command_id, reply);
        Ok(())
    }

    /// Telemetry from a device link, relayed to every subscriber on every worker.
    fn device_event(&self, conn: &Connection, msg: &Envelope) -> Result<(), GatewayError> {
        let device_id = link_device(conn)?;
        let event = msg.payload_str("event").unwrap_or("telemetry");
        let data = msg.payload.get("data").cloned().unwrap_or(Value::Null);
        self.metrics.device_events.fetch_add(1, Ordering::Relaxed);

        let envelope = message::device_event(device_id, event, data.clone());
        let filter = json!({"subscriptions": {"$contains": device_id}});
        // workers of this instance get it even when the backend is down
        if let Err(e) = self.bus.publish(
            &BusChannel::Broadcast,
            &BusMessage::Broadcast { filter, envelope },
        ) {
            tracing::debug!(device_id, error = %e, "device event not relayed to other instances");
        }
        self.dispatcher.publish_telemetry(device_id, event, data);
        Ok(())
    }
}

impl MessageHandler for Router {
    fn handle<'a>(&'a self, conn_id: &'a str, msg: Envelope) -> BoxFuture<'a, ()> {
        Box::pin(self.route(conn_id, msg))
    }
}

fn required<'a>(msg: &'a Envelope, key: &str) -> Result<&'a str, GatewayError> {
    msg.payload_str(key)
        .ok_or_else(|| GatewayError::InvalidMessage(format!("{} requires payload.{key}", msg.msg_type)))
}

fn link_device(conn: &Connection) -> Result<&str, GatewayError> {
    match (conn.role, conn.device_id.as_deref()) {
        (ClientRole::Device, Some(device_id)) => Ok(device_id),
        _ => Err(GatewayError::InvalidMessage(
            "only device links may report results and events".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::gateway::dispatcher::DeviceEvent;
    use crate::gateway::registry::OutboundFrame;
    use crate::gateway::registry::tests::{claims, test_conn};
    use crate::jwt::TokenClaims;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        router: Router,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        links: Arc<DeviceLinks>,
        bus: Arc<Bus>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let links = Arc::new(DeviceLinks::new());
        let config = DispatcherConfig {
            default_timeout_ms: 5_000,
            ..DispatcherConfig::default()
        };
        let dispatcher = Arc::new(CommandDispatcher::new(links.clone(), &config));
        let bus = Bus::local("node", None);
        Fixture {
            router: Router::new(registry.clone(), dispatcher.clone(), links.clone(), bus.clone()),
            registry,
            dispatcher,
            links,
            bus,
        }
    }

    impl Fixture {
        fn connect(&self, id: &str, claims: TokenClaims) -> UnboundedReceiver<OutboundFrame> {
            let (conn, rx) = test_conn(id, claims);
            self.registry.register(conn);
            rx
        }

        /// Register a device link the way a worker does on connect.
        fn link(&self, id: &str, device_id: &str) -> UnboundedReceiver<OutboundFrame> {
            let mut device = claims("device-user", Some(device_id), "eu");
            device.role = ClientRole::Device;
            let (conn, rx) = test_conn(id, device);
            self.registry.register(conn.clone());
            self.links.attach(device_id, conn);
            self.dispatcher.device_online(device_id);
            rx
        }
    }

    fn inbound(msg_type: &str, payload: Value) -> Envelope {
        Envelope::new(msg_type, payload)
    }

    async fn next(rx: &mut UnboundedReceiver<OutboundFrame>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame in time");
        match frame {
            Some(OutboundFrame::Text(text)) => Envelope::parse(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_answers_with_pong() {
        let f = fixture();
        let mut rx = f.connect("c1", claims("alice", None, "eu"));
        f.router
            .handle("c1", inbound("ping", json!({"timestamp": 1_000})))
            .await;
        let pong = next(&mut rx).await;
        assert_eq!(pong.msg_type, "pong");
        assert_eq!(pong.payload["clientTimestamp"], 1_000);
    }

    #[tokio::test]
    async fn command_round_trip_through_device_link() {
        let f = fixture();
        let mut client = f.connect("c1", claims("alice", None, "eu"));
        let mut device = f.link("link-1", "lamp");

        f.router
            .handle(
                "c1",
                inbound(
                    "device_command",
                    json!({"deviceId": "lamp", "commandId": "cmd-1", "command": {"op": "on"}}),
                ),
            )
            .await;

        let pushed = next(&mut device).await;
        assert_eq!(pushed.msg_type, "device_command");
        assert_eq!(pushed.payload_str("commandId"), Some("cmd-1"));

        f.router
            .handle(
                "link-1",
                inbound(
                    "command_result",
                    json!({"commandId": "cmd-1", "success": true, "result": {"state": "on"}}),
                ),
            )
            .await;

        let done = next(&mut client).await;
        assert_eq!(done.msg_type, "command_success");
        assert_eq!(done.payload["commandId"], "cmd-1");
        assert_eq!(done.payload["result"]["state"], "on");
        assert_eq!(done.payload["attempts"], 1);
    }

    #[tokio::test]
    async fn failed_result_surfaces_as_error_after_retries() {
        let f = fixture();
        let mut client = f.connect("c1", claims("alice", None, "eu"));
        let mut device = f.link("link-1", "lamp");

        f.router
            .handle(
                "c1",
                inbound(
                    "device_command",
                    json!({"deviceId": "lamp", "commandId": "cmd-9", "maxAttempts": 1}),
                ),
            )
            .await;
        next(&mut device).await;
        f.router
            .handle(
                "link-1",
                inbound(
                    "command_result",
                    json!({"commandId": "cmd-9", "success": false, "error": "jammed"}),
                ),
            )
            .await;

        let err = next(&mut client).await;
        assert_eq!(err.msg_type, "error");
        assert_eq!(err.payload["code"], "TRANSPORT_ERROR");
        assert_eq!(err.payload["refId"], "cmd-9");
    }

    #[tokio::test]
    async fn offline_device_queues_or_rejects() {
        let f = fixture();
        let mut rx = f.connect("c1", claims("alice", None, "eu"));

        f.router
            .handle(
                "c1",
                inbound("device_command", json!({"deviceId": "ghost", "commandId": "q1"})),
            )
            .await;
        let queued = next(&mut rx).await;
        assert_eq!(queued.msg_type, "command_queued");
        assert_eq!(queued.payload["commandId"], "q1");

        f.router
            .handle(
                "c1",
                inbound(
                    "device_command",
                    json!({"deviceId": "ghost", "commandId": "q2", "queueIfOffline": false}),
                ),
            )
            .await;
        let rejected = next(&mut rx).await;
        assert_eq!(rejected.payload["code"], "DEVICE_OFFLINE");
        assert_eq!(rejected.payload["refId"], "q2");
    }

    #[tokio::test]
    async fn subscriptions_rooms_and_listing() {
        let f = fixture();
        let mut rx = f.connect("c1", claims("alice", None, "eu"));
        let _device = f.link("link-1", "lamp");

        f.router
            .handle("c1", inbound("subscribe_device", json!({"deviceId": "lamp"})))
            .await;
        assert_eq!(next(&mut rx).await.msg_type, "subscription_success");
        assert_eq!(f.registry.subscribers_of("lamp").len(), 1);

        f.router
            .handle("c1", inbound("join_room", json!({"room": "lobby"})))
            .await;
        assert_eq!(next(&mut rx).await.msg_type, "room_joined");
        assert_eq!(f.registry.lookup("c1").unwrap().rooms(), vec!["lobby"]);

        f.router
            .handle("c1", inbound("device_status", json!({"deviceId": "lamp"})))
            .await;
        let status = next(&mut rx).await;
        assert_eq!(status.payload["status"]["online"], true);
        assert_eq!(status.payload["status"]["linked"], true);

        f.router.handle("c1", inbound("list_devices", json!({}))).await;
        let list = next(&mut rx).await;
        assert_eq!(list.payload["devices"][0]["deviceId"], "lamp");

        f.router
            .handle("c1", inbound("unsubscribe_device", json!({"deviceId": "lamp"})))
            .await;
        assert_eq!(next(&mut rx).await.msg_type, "unsubscription_success");
        assert!(f.registry.subscribers_of("lamp").is_empty());

        f.router
            .handle("c1", inbound("leave_room", json!({"room": "lobby"})))
            .await;
        assert_eq!(next(&mut rx).await.msg_type, "room_left");
    }

    #[tokio::test]
    async fn device_events_are_relayed_over_the_bus() {
        let f = fixture();
        let mut bus_rx = f.bus.subscribe();
        let mut events = f.dispatcher.subscribe();
        let _device = f.link("link-1", "lamp");

        f.router
            .handle(
                "link-1",
                inbound("device_event", json!({"event": "temperature", "data": {"c": 21}})),
            )
            .await;

        let delivery = bus_rx.recv().await.unwrap();
        match &delivery.message {
            BusMessage::Broadcast { filter, envelope } => {
                assert_eq!(filter["subscriptions"]["$contains"], "lamp");
                assert_eq!(envelope.msg_type, "device_event");
                assert_eq!(envelope.payload["data"]["c"], 21);
            }
            other => panic!("unexpected {other:?}"),
        }
        loop {
            if let DeviceEvent::Telemetry { event, .. } = events.recv().await.unwrap() {
                assert_eq!(event, "temperature");
                break;
            }
        }
    }

    #[tokio::test]
    async fn invalid_messages_get_error_replies() {
        let f = fixture();
        let mut rx = f.connect("c1", claims("alice", None, "eu"));

        f.router.handle("c1", inbound("teleport", json!({}))).await;
        assert_eq!(next(&mut rx).await.payload["code"], "INVALID_MESSAGE");

        // clients cannot impersonate device links
        f.router
            .handle("c1", inbound("command_result", json!({"commandId": "x"})))
            .await;
        assert_eq!(next(&mut rx).await.payload["code"], "INVALID_MESSAGE");

        f.router.handle("c1", inbound("subscribe_device", json!({}))).await;
        assert_eq!(next(&mut rx).await.payload["code"], "INVALID_MESSAGE");
        assert_eq!(f.router.metrics.invalid.load(Ordering::Relaxed), 3);

        // messages for closed connections are dropped quietly
        f.router.handle("gone", inbound("ping", json!({}))).await;
        assert_eq!(f.router.metrics.orphaned.load(Ordering::Relaxed), 1);
    }
}
