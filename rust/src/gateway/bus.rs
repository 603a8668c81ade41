// =============================================================================
// Cross-worker publish/subscribe bus.
//
// Channels (all under the `wse:` prefix):
//   wse:broadcast        relay to every connection matching a filter, any worker
//   wse:worker:{name}    point-to-point to one worker
//   wse:metrics          aggregated cluster metrics and alerts
//   wse:heartbeat        worker health records
//   wse:control          cluster-wide control (shutdown)
//
// A frame on the wire is `{origin, body, signature?}` where `body` is the
// JSON-encoded `BusMessage` and `signature` covers channel and body.
// Every instance receives its own publishes straight from `publish`, whatever
// the backend; the backend's echo of them is dropped on ingest.
// =============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::message::Envelope;
use super::queue::SchedulerSnapshot;
use super::security::BusSigner;
use crate::error::GatewayError;

pub const CHANNEL_PREFIX: &str = "wse:";
pub const CHANNEL_PATTERN: &str = "wse:*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusChannel {
    Broadcast,
    Worker(String),
    Metrics,
    Heartbeat,
    Control,
}

impl BusChannel {
    pub fn name(&self) -> String {
        match self {
            Self::Broadcast => "wse:broadcast".to_string(),
            Self::Worker(name) => format!("wse:worker:{name}"),
            Self::Metrics => "wse:metrics".to_string(),
            Self::Heartbeat => "wse:heartbeat".to_string(),
            Self::Control => "wse:control".to_string(),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.strip_prefix(CHANNEL_PREFIX)? {
            "broadcast" => Some(Self::Broadcast),
            "metrics" => Some(Self::Metrics),
            "heartbeat" => Some(Self::Heartbeat),
            "control" => Some(Self::Control),
            rest => rest
                .strip_prefix("worker:")
                .filter(|w| !w.is_empty())
                .map(|w| Self::Worker(w.to_string())),
        }
    }
}

/// Health record a worker publishes on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHeartbeat {
    pub worker_id: usize,
    pub pid: u32,
    pub connections: usize,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub queues: SchedulerSnapshot,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub level: AlertLevel,
    pub worker_id: Option<usize>,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusMessage {
    /// Deliver `envelope` to every connection whose attributes match `filter`.
    Broadcast { filter: Value, envelope: Envelope },
    /// Same, restricted to the addressed worker's connections.
    Deliver { filter: Value, envelope: Envelope },
    Heartbeat(WorkerHeartbeat),
    Metrics { snapshot: Value },
    Alert(Alert),
    /// Stop accepting connections and drain within `drain_ms`.
    Shutdown { drain_ms: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: BusChannel,
    /// Instance id of the publisher.
    pub origin: String,
    pub message: BusMessage,
}

#[derive(Serialize, Deserialize)]
struct Frame {
    origin: String,
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// Where published frames go when the bus spans processes.
pub trait BusOutlet: Send + Sync + 'static {
    fn publish(&self, channel: &str, payload: String) -> Result<(), GatewayError>;
}

#[derive(Default)]
pub struct BusMetrics {
    pub published: AtomicU64,
    pub received: AtomicU64,
    pub publish_errors: AtomicU64,
    pub rejected_signature: AtomicU64,
    pub malformed: AtomicU64,
    /// Own frames echoed back by the backend.
    pub own_echoes: AtomicU64,
}

pub struct Bus {
    instance_id: String,
    signer: Option<BusSigner>,
    /// `None` loops frames straight back into `ingest` (single process).
    outlet: Option<Arc<dyn BusOutlet>>,
    inbound: broadcast::Sender<Arc<Delivery>>,
    pub metrics: BusMetrics,
}

const INBOUND_CAPACITY: usize = 4096;

impl Bus {
    fn build(
        instance_id: String,
        signer: Option<BusSigner>,
        outlet: Option<Arc<dyn BusOutlet>>,
    ) -> Arc<Self> {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Arc::new(Self {
            instance_id,
            signer,
            outlet,
            inbound,
            metrics: BusMetrics::default(),
        })
    }

    /// In-process bus for single-instance deployments and tests.
    pub fn local(instance_id: impl Into<String>, signer: Option<BusSigner>) -> Arc<Self> {
        Self::build(instance_id.into(), signer, None)
    }

    pub fn with_outlet(
        instance_id: impl Into<String>,
        signer: Option<BusSigner>,
        outlet: Arc<dyn BusOutlet>,
    ) -> Arc<Self> {
        Self::build(instance_id.into(), signer, Some(outlet))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn publish(&self, channel: &BusChannel, message: &BusMessage) -> Result<(), GatewayError> {
        let name = channel.name();
        let body = serde_json::to_string(message)
            .map_err(|e| GatewayError::ClusterCoordination(format!("encode bus message: {e}")))?;
        let signature = self.signer.as_ref().map(|s| s.sign(&name, &body));
        let payload = serde_json::to_string(&Frame {
            origin: self.instance_id.clone(),
            body,
            signature,
        })
        .map_err(|e| GatewayError::ClusterCoordination(format!("encode bus frame: {e}")))?;

        // local subscribers first, so a backend outage never hides this
        // instance's own traffic from itself
        let _ = self.inbound.send(Arc::new(Delivery {
            channel: channel.clone(),
            origin: self.instance_id.clone(),
            message: message.clone(),
        }));
        if let Some(outlet) = &self.outlet {
            outlet.publish(&name, payload).inspect_err(|e| {
                self.metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %name, error = %e, "bus publish failed");
            })?;
        }
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Delivery>> {
        self.inbound.subscribe()
    }

    /// Accept one raw frame from the backend. Frames with an unknown channel,
    /// bad JSON or a failing signature are dropped and counted, as are this
    /// instance's own frames coming back.
    pub fn ingest(&self, channel_name: &str, payload: &str) -> bool {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        let Some(channel) = BusChannel::parse(channel_name) else {
            self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let Ok(frame) = serde_json::from_str::<Frame>(payload) else {
            self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(channel = channel_name, "dropping malformed bus frame");
            return false;
        };
        if frame.origin == self.instance_id {
            self.metrics.own_echoes.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Some(signer) = &self.signer {
            let valid = frame
                .signature
                .as_deref()
                .is_some_and(|sig| signer.verify(channel_name, &frame.body, sig));
            if !valid {
                self.metrics
                    .rejected_signature
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = channel_name, origin = %frame.origin, "bus frame failed signature check");
                return false;
            }
        }
        let Ok(message) = serde_json::from_str::<BusMessage>(&frame.body) else {
            self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        // no receivers is fine: nobody is listening yet
        let _ = self.inbound.send(Arc::new(Delivery {
            channel,
            origin: frame.origin,
            message,
        }));
        true
    }
}
