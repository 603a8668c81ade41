// Connection registry: the primary map of live connections plus the region,
// device, user and device-subscriber indexes.
//
// All indexes live behind one RwLock so a reader never sees a connection in a
// secondary index that is missing from the primary map. Lock order is always
// registry lock first, then a connection's session mutex.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashSet;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::compression::PayloadCodec;
use super::message::{Envelope, epoch_ms};
use super::rate_limiter::FixedWindow;
use crate::error::GatewayError;
use crate::jwt::{ClientRole, TokenClaims};

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Messages counted in each direction and an exponential moving average of
/// client-to-server latency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub avg_latency_ms: f64,
}

const LATENCY_EMA_ALPHA: f64 = 0.2;

pub struct SessionState {
    pub last_activity: Instant,
    pub subscriptions: AHashSet<String>,
    pub rooms: AHashSet<String>,
    pub rate: FixedWindow,
    pub perf: PerfSnapshot,
    /// Commands that must be cancelled when this connection closes.
    pub tied_commands: Vec<String>,
}

/// One live duplex channel. Identity is fixed at admission; session state
/// sits behind its own mutex so different connections never contend.
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub session_id: String,
    pub region: String,
    pub role: ClientRole,
    pub source: IpAddr,
    pub created_at: Instant,
    pub created_at_ms: i64,
    codec: Option<PayloadCodec>,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    torn_down: AtomicBool,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        id: String,
        claims: TokenClaims,
        source: IpAddr,
        rate: FixedWindow,
        codec: Option<PayloadCodec>,
        tx: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            user_id: claims.user_id,
            device_id: claims.device_id,
            session_id: claims.session_id,
            region: claims.region,
            role: claims.role,
            source,
            created_at: now,
            created_at_ms: epoch_ms(),
            codec,
            tx,
            torn_down: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                last_activity: now,
                subscriptions: AHashSet::new(),
                rooms: AHashSet::new(),
                rate,
                perf: PerfSnapshot::default(),
                tied_commands: Vec::new(),
            }),
        }
    }

    /// Pass-through to the writer task. A closed channel is reported to the
    /// caller, who is responsible for unregistering the connection.
    pub fn send(&self, env: &Envelope) -> Result<(), GatewayError> {
        let text = match self.codec {
            Some(codec) => {
                let mut env = env.clone();
                codec.deflate(&mut env);
                env.to_text()
            }
            None => env.to_text(),
        };
        self.tx
            .send(OutboundFrame::Text(text))
            .map_err(|_| GatewayError::ChannelClosed)?;
        self.state.lock().perf.messages_sent += 1;
        Ok(())
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// True exactly once: for the first caller to start tearing this
    /// connection down.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn wants_compression(&self) -> bool {
        self.codec.is_some()
    }

    /// Fixed-window admission for one inbound message.
    pub fn check_rate(&self) -> bool {
        self.state.lock().rate.try_acquire()
    }

    /// Note an inbound message; `client_ts` feeds the latency average when plausible.
    pub fn record_received(&self, client_ts: i64) {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        state.perf.messages_received += 1;
        let latency = epoch_ms() - client_ts;
        if client_ts > 0 && latency >= 0 {
            let sample = latency as f64;
            state.perf.avg_latency_ms = if state.perf.messages_received == 1 {
                sample
            } else {
                state.perf.avg_latency_ms * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA
            };
        }
    }

    pub fn perf(&self) -> PerfSnapshot {
        self.state.lock().perf.clone()
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.iter().cloned().collect()
    }

    pub fn is_subscribed(&self, device_id: &str) -> bool {
        self.state.lock().subscriptions.contains(device_id)
    }

    pub fn join_room(&self, room: &str) -> bool {
        self.state.lock().rooms.insert(room.to_string())
    }

    pub fn leave_room(&self, room: &str) -> bool {
        self.state.lock().rooms.remove(room)
    }

    pub fn rooms(&self) -> Vec<String> {
        self.state.lock().rooms.iter().cloned().collect()
    }

    pub fn tie_command(&self, command_id: &str) {
        self.state.lock().tied_commands.push(command_id.to_string());
    }

    pub fn take_tied_commands(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().tied_commands)
    }

    /// Attribute document evaluated by broadcast filters.
    pub fn attributes(&self) -> Value {
        let state = self.state.lock();
        let mut rooms: Vec<&String> = state.rooms.iter().collect();
        rooms.sort();
        let mut subscriptions: Vec<&String> = state.subscriptions.iter().collect();
        subscriptions.sort();
        json!({
            "connectionId": self.id,
            "userId": self.user_id,
            "deviceId": self.device_id,
            "sessionId": self.session_id,
            "region": self.region,
            "role": match self.role {
                ClientRole::Client => "client",
                ClientRole::Device => "device",
            },
            "rooms": rooms,
            "subscriptions": subscriptions,
        })
    }
}

#[derive(Default)]
struct Indexes {
    primary: HashMap<String, Arc<Connection>>,
    by_region: HashMap<String, AHashSet<String>>,
    by_device: HashMap<String, AHashSet<String>>,
    by_user: HashMap<String, AHashSet<String>>,
    /// device id -> connections subscribed to its events
    subscribers: HashMap<String, AHashSet<String>>,
}

fn index_insert(index: &mut HashMap<String, AHashSet<String>>, key: &str, id: &str) {
    index
        .entry(key.to_string())
        .or_default()
        .insert(id.to_string());
}

fn index_remove(index: &mut HashMap<String, AHashSet<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

fn index_get(index: &HashMap<String, AHashSet<String>>, key: &str) -> Vec<String> {
    index
        .get(key)
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default()
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into the primary map and every secondary index. Returns false
    /// (and changes nothing) if the id is already registered.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let mut idx = self.inner.write();
        if idx.primary.contains_key(&conn.id) {
            return false;
        }
        index_insert(&mut idx.by_region, &conn.region, &conn.id);
        index_insert(&mut idx.by_user, &conn.user_id, &conn.id);
        if let Some(device_id) = &conn.device_id {
            index_insert(&mut idx.by_device, device_id, &conn.id);
        }
        idx.primary.insert(conn.id.clone(), conn);
        true
    }

    /// Remove a connection from every index. Unknown ids are a no-op.
    pub fn unregister(&self, conn_id: &str) -> Option<Arc<Connection>> {
        let mut idx = self.inner.write();
        let conn = idx.primary.remove(conn_id)?;
        index_remove(&mut idx.by_region, &conn.region, conn_id);
        index_remove(&mut idx.by_user, &conn.user_id, conn_id);
        if let Some(device_id) = &conn.device_id {
            index_remove(&mut idx.by_device, device_id, conn_id);
        }
        for device_id in conn.state.lock().subscriptions.drain() {
            index_remove(&mut idx.subscribers, &device_id, conn_id);
        }
        Some(conn)
    }

    pub fn lookup(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.inner.read().primary.get(conn_id).cloned()
    }

    pub fn by_region(&self, region: &str) -> Vec<String> {
        index_get(&self.inner.read().by_region, region)
    }

    pub fn by_device(&self, device_id: &str) -> Vec<String> {
        index_get(&self.inner.read().by_device, device_id)
    }

    pub fn by_user(&self, user_id: &str) -> Vec<String> {
        index_get(&self.inner.read().by_user, user_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().primary.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().primary.values().cloned().collect()
    }

    /// Subscribe a connection to a device's events. Returns false for unknown connections.
    pub fn subscribe(&self, conn_id: &str, device_id: &str) -> bool {
        let mut idx = self.inner.write();
        let Some(conn) = idx.primary.get(conn_id).cloned() else {
            return false;
        };
        conn.state.lock().subscriptions.insert(device_id.to_string());
        index_insert(&mut idx.subscribers, device_id, conn_id);
        true
    }

    pub fn unsubscribe(&self, conn_id: &str, device_id: &str) -> bool {
        let mut idx = self.inner.write();
        let Some(conn) = idx.primary.get(conn_id).cloned() else {
            return false;
        };
        let removed = conn.state.lock().subscriptions.remove(device_id);
        index_remove(&mut idx.subscribers, device_id, conn_id);
        removed
    }

    pub fn subscribers_of(&self, device_id: &str) -> Vec<Arc<Connection>> {
        let idx = self.inner.read();
        idx.subscribers
            .get(device_id)
            .map(|ids| ids.iter().filter_map(|id| idx.primary.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Connections whose attributes satisfy a broadcast filter.
    pub fn matching(&self, filter: &Value) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|conn| super::filters::matches(&conn.attributes(), filter))
            .collect()
    }

    /// Send to one connection. Closed channels are unregistered here as a
    /// separate step after the failed send.
    pub fn send_to(&self, conn_id: &str, env: &Envelope) -> Result<(), GatewayError> {
        let conn = self.lookup(conn_id).ok_or(GatewayError::ChannelClosed)?;
        conn.send(env).inspect_err(|_| {
            self.unregister(conn_id);
        })
    }

    /// Deliver to each connection, unregistering the ones whose channel closed.
    /// Returns (delivered, dropped).
    pub fn deliver(&self, targets: &[Arc<Connection>], env: &Envelope) -> (u64, u64) {
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for conn in targets {
            match conn.send(env) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    dropped += 1;
                    self.unregister(&conn.id);
                }
            }
        }
        (delivered, dropped)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    pub(crate) fn claims(user: &str, device: Option<&str>, region: &str) -> TokenClaims {
        TokenClaims {
            user_id: user.to_string(),
            device_id: device.map(str::to_string),
            session_id: format!("s-{user}"),
            region: region.to_string(),
            role: ClientRole::Client,
            expires_at: 0,
        }
    }

    pub(crate) fn test_conn(
        id: &str,
        claims: TokenClaims,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            id.to_string(),
            claims,
            IpAddr::from([127, 0, 0, 1]),
            FixedWindow::new(100, Duration::from_secs(1)),
            None,
            tx,
        );
        (Arc::new(conn), rx)
    }

    #[test]
    fn register_populates_every_index() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = test_conn("c1", claims("alice", Some("d1"), "eu"));
        let (c2, _rx2) = test_conn("c2", claims("alice", None, "us"));
        assert!(registry.register(c1));
        assert!(registry.register(c2));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_region("eu"), vec!["c1".to_string()]);
        assert_eq!(registry.by_device("d1"), vec!["c1".to_string()]);
        let mut users = registry.by_user("alice");
        users.sort();
        assert_eq!(users, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = test_conn("c1", claims("alice", None, "eu"));
        let (dup, _rx2) = test_conn("c1", claims("bob", None, "us"));
        assert!(registry.register(c1));
        assert!(!registry.register(dup));
        assert!(registry.by_user("bob").is_empty());
        assert_eq!(registry.lookup("c1").map(|c| c.user_id.clone()), Some("alice".into()));
    }

    #[test]
    fn unregister_clears_every_index_and_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx) = test_conn("c1", claims("alice", Some("d1"), "eu"));
        registry.register(c1);
        assert!(registry.subscribe("c1", "d9"));

        assert!(registry.unregister("c1").is_some());
        assert!(registry.lookup("c1").is_none());
        assert!(registry.by_region("eu").is_empty());
        assert!(registry.by_device("d1").is_empty());
        assert!(registry.by_user("alice").is_empty());
        assert!(registry.subscribers_of("d9").is_empty());

        assert!(registry.unregister("c1").is_none());
        assert!(registry.unregister("never-seen").is_none());
    }

    #[test]
    fn subscriptions_route_device_events() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = test_conn("c1", claims("alice", None, "eu"));
        let (c2, _rx2) = test_conn("c2", claims("bob", None, "eu"));
        registry.register(c1);
        registry.register(c2);
        registry.subscribe("c1", "thermo");
        registry.subscribe("c2", "thermo");
        registry.unsubscribe("c2", "thermo");

        let subs = registry.subscribers_of("thermo");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, "c1");
        assert!(!registry.subscribe("nope", "thermo"));
    }

    #[test]
    fn send_reports_closed_channel_and_caller_unregisters() {
        let registry = ConnectionRegistry::new();
        let (c1, rx) = test_conn("c1", claims("alice", None, "eu"));
        registry.register(c1.clone());
        drop(rx);

        let env = Envelope::new("pong", json!({}));
        assert_eq!(c1.send(&env), Err(GatewayError::ChannelClosed));
        // the connection stays registered until someone unregisters it
        assert!(registry.lookup("c1").is_some());
        assert_eq!(registry.send_to("c1", &env), Err(GatewayError::ChannelClosed));
        assert!(registry.lookup("c1").is_none());
    }

    #[test]
    fn matching_uses_connection_attributes() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = test_conn("c1", claims("alice", None, "eu"));
        let (c2, _rx2) = test_conn("c2", claims("bob", None, "us"));
        registry.register(c1.clone());
        registry.register(c2);
        c1.join_room("ops");

        let hits = registry.matching(&json!({"rooms": "ops"}));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");
        assert_eq!(registry.matching(&json!({})).len(), 2);
    }

    #[tokio::test]
    async fn send_counts_messages() {
        let (c1, mut rx) = test_conn("c1", claims("alice", None, "eu"));
        c1.send(&Envelope::new("pong", json!({}))).unwrap();
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Text(t)) if t.contains("pong")));
        c1.record_received(epoch_ms() - 10);
        let perf = c1.perf();
        assert_eq!(perf.messages_sent, 1);
        assert_eq!(perf.messages_received, 1);
        assert!(perf.avg_latency_ms >= 10.0);
    }
}
