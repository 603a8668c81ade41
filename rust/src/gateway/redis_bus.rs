// Redis backend for the cluster bus.
//
//   - Outbound frames queue on an unbounded channel and go out as one
//     PUBLISH pipeline per batch (up to 64 frames), retried twice
//   - Inbound: PSUBSCRIBE `wse:*`, every message handed to `Bus::ingest`
//   - A dropped session reconnects with jittered exponential delay; repeated
//     connect failures open a breaker that pauses reconnecting entirely
//   - Frames that cannot be published are parked in a bounded dead-letter
//     store, oldest evicted first

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bus::{Bus, BusOutlet, CHANNEL_PATTERN};
use super::reliability::{BackoffKind, Breaker, ReconnectDelay};
use super::security::BusSigner;
use crate::error::GatewayError;

const PIPELINE_MAX: usize = 64;
const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_BASE: Duration = Duration::from_millis(100);
const PUBLISH_RETRY_MAX: Duration = Duration::from_millis(200);
const DEAD_LETTER_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct BusFrame {
    pub channel: String,
    pub payload: String,
}

enum Outbound {
    Frame(BusFrame),
    Stop,
}

#[derive(Default)]
pub struct RedisBusMetrics {
    pub received: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub connected: AtomicBool,
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub frame: BusFrame,
    pub reason: String,
}

pub struct DeadLetters {
    parked: VecDeque<DeadLetter>,
    capacity: usize,
    evicted: u64,
}

impl DeadLetters {
    pub fn new(capacity: usize) -> Self {
        Self {
            parked: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    fn park(&mut self, frames: impl IntoIterator<Item = BusFrame>, reason: &str) {
        for frame in frames {
            if self.parked.len() == self.capacity {
                self.parked.pop_front();
                self.evicted += 1;
            }
            self.parked.push_back(DeadLetter {
                frame,
                reason: reason.to_string(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Frames lost because the store was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn take(&mut self) -> Vec<DeadLetter> {
        self.parked.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Outlet and owner handle
// ---------------------------------------------------------------------------

/// Hands frames to the session task. While the session is down the frame is
/// still queued (and parked) but the publish reports failure.
struct RedisOutlet {
    tx: mpsc::UnboundedSender<Outbound>,
    metrics: Arc<RedisBusMetrics>,
}

impl BusOutlet for RedisOutlet {
    fn publish(&self, channel: &str, payload: String) -> Result<(), GatewayError> {
        let frame = BusFrame {
            channel: channel.to_string(),
            payload,
        };
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| GatewayError::ClusterCoordination("redis bus stopped".into()))?;
        if !self.metrics.connected.load(Ordering::Acquire) {
            return Err(GatewayError::ClusterCoordination("redis disconnected".into()));
        }
        Ok(())
    }
}

/// Keeps the Redis session task alive; dropping it without `shutdown` leaves
/// the task running until the process exits.
pub struct RedisBus {
    tx: mpsc::UnboundedSender<Outbound>,
    pub metrics: Arc<RedisBusMetrics>,
    dead: Arc<Mutex<DeadLetters>>,
    task: JoinHandle<()>,
}

struct Shared {
    url: String,
    bus: Arc<Bus>,
    metrics: Arc<RedisBusMetrics>,
    dead: Arc<Mutex<DeadLetters>>,
}

impl RedisBus {
    /// Spawn the session task and return a bus that publishes through it.
    pub fn start(
        url: String,
        instance_id: impl Into<String>,
        signer: Option<BusSigner>,
    ) -> (Arc<Bus>, RedisBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(RedisBusMetrics::default());
        let outlet = RedisOutlet {
            tx: tx.clone(),
            metrics: metrics.clone(),
        };
        let bus = Bus::with_outlet(instance_id, signer, Arc::new(outlet));
        let shared = Shared {
            url,
            bus: bus.clone(),
            metrics: metrics.clone(),
            dead: Arc::new(Mutex::new(DeadLetters::new(DEAD_LETTER_CAPACITY))),
        };
        let dead = shared.dead.clone();
        let task = tokio::spawn(supervise(shared, rx));
        (
            bus,
            RedisBus {
                tx,
                metrics,
                dead,
                task,
            },
        )
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.lock().take()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead.lock().len()
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(Outbound::Stop);
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

enum SessionEnd {
    Stopped,
    /// Never got as far as subscribing.
    ConnectFailed(redis::RedisError),
    /// Was up, then the subscription stream ended.
    Dropped,
}

/// Publish one batch as a pipeline, retrying with linear delay. Failed
/// batches are parked. Returns whether the batch went out.
async fn publish_batch(
    conn: &mut redis::aio::MultiplexedConnection,
    batch: &mut Vec<BusFrame>,
    shared: &Shared,
) -> bool {
    let mut attempt = 0;
    let error = loop {
        attempt += 1;
        let mut pipe = redis::pipe();
        for frame in batch.iter() {
            pipe.cmd("PUBLISH")
                .arg(&frame.channel)
                .arg(&frame.payload)
                .ignore();
        }
        match pipe.query_async::<()>(conn).await {
            Ok(()) => {
                shared
                    .metrics
                    .published
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                batch.clear();
                return true;
            }
            Err(e) if attempt >= PUBLISH_ATTEMPTS => break e,
            Err(_) => {
                let delay =
                    BackoffKind::Linear.delay(attempt, PUBLISH_RETRY_BASE, PUBLISH_RETRY_MAX);
                tokio::time::sleep(delay).await;
            }
        }
    };
    tracing::warn!(frames = batch.len(), error = %error, "bus publish failed, frames parked");
    park(shared, batch.drain(..), &error.to_string());
    false
}

fn park(shared: &Shared, frames: impl IntoIterator<Item = BusFrame>, reason: &str) {
    let mut dead = shared.dead.lock();
    let before = dead.len() as u64 + dead.evicted();
    dead.park(frames, reason);
    let parked = dead.len() as u64 + dead.evicted() - before;
    shared
        .metrics
        .publish_failures
        .fetch_add(parked, Ordering::Relaxed);
}

async fn run_session(shared: &Shared, rx: &mut mpsc::UnboundedReceiver<Outbound>) -> SessionEnd {
    let connected = async {
        let client = redis::Client::open(shared.url.as_str())?;
        let publisher = client.get_multiplexed_tokio_connection().await?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(CHANNEL_PATTERN).await?;
        Ok::<_, redis::RedisError>((publisher, pubsub))
    };
    let (mut publisher, pubsub) = match connected.await {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::ConnectFailed(e),
    };
    shared.metrics.connected.store(true, Ordering::Release);
    tracing::info!(pattern = CHANNEL_PATTERN, "redis bus connected");

    let outbound = async {
        let mut breaker = Breaker::default();
        let mut batch = Vec::with_capacity(PIPELINE_MAX);
        loop {
            match rx.recv().await {
                Some(Outbound::Frame(frame)) => batch.push(frame),
                Some(Outbound::Stop) | None => return SessionEnd::Stopped,
            }
            while batch.len() < PIPELINE_MAX {
                match rx.try_recv() {
                    Ok(Outbound::Frame(frame)) => batch.push(frame),
                    Ok(Outbound::Stop) => return SessionEnd::Stopped,
                    Err(_) => break,
                }
            }
            if !breaker.allow() {
                park(shared, batch.drain(..), "publish breaker open");
                continue;
            }
            if publish_batch(&mut publisher, &mut batch, shared).await {
                breaker.on_success();
            } else {
                breaker.on_failure();
            }
        }
    };

    let inbound = async {
        let messages = pubsub.into_on_message();
        tokio::pin!(messages);
        while let Some(msg) = messages.next().await {
            shared.metrics.received.fetch_add(1, Ordering::Relaxed);
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    shared.bus.ingest(msg.get_channel_name(), &payload);
                }
                Err(e) => tracing::debug!(error = %e, "non-text bus payload ignored"),
            }
        }
        SessionEnd::Dropped
    };

    let end = tokio::select! {
        end = outbound => end,
        end = inbound => end,
    };
    shared.metrics.connected.store(false, Ordering::Release);
    end
}

/// Run sessions until asked to stop, reconnecting in between.
async fn supervise(shared: Shared, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut delay = ReconnectDelay::default();
    let mut connects = Breaker::default();
    loop {
        let wait = if connects.allow() {
            match run_session(&shared, &mut rx).await {
                SessionEnd::Stopped => break,
                SessionEnd::Dropped => {
                    delay.reset();
                    connects.on_success();
                    tracing::warn!("redis bus session dropped, reconnecting");
                }
                SessionEnd::ConnectFailed(e) => {
                    connects.on_failure();
                    tracing::warn!(error = %e, "redis bus connect failed");
                }
            }
            shared.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            delay.next()
        } else {
            tracing::warn!(
                pause_s = connects.open_for().as_secs(),
                "redis bus reconnects paused"
            );
            connects.open_for()
        };
        if park_until(&shared, &mut rx, wait).await {
            break;
        }
    }
    tracing::info!("redis bus stopped");
}

/// While disconnected, park every outbound frame until `wait` passes.
/// Returns true when asked to stop.
async fn park_until(
    shared: &Shared,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    wait: Duration,
) -> bool {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => return false,
            next = rx.recv() => match next {
                Some(Outbound::Frame(frame)) => park(shared, [frame], "redis disconnected"),
                Some(Outbound::Stop) | None => return true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: &str) -> BusFrame {
        BusFrame {
            channel: channel.into(),
            payload: "{}".into(),
        }
    }

    fn shared() -> Shared {
        Shared {
            url: "redis://127.0.0.1:1".into(),
            bus: Bus::local("test", None),
            metrics: Arc::new(RedisBusMetrics::default()),
            dead: Arc::new(Mutex::new(DeadLetters::new(10))),
        }
    }

    #[test]
    fn dead_letters_evict_oldest_and_count_it() {
        let mut dead = DeadLetters::new(2);
        dead.park(
            [frame("wse:a"), frame("wse:b"), frame("wse:c")],
            "down",
        );
        assert_eq!(dead.evicted(), 1);
        let letters = dead.take();
        let channels: Vec<_> = letters.iter().map(|l| l.frame.channel.as_str()).collect();
        assert_eq!(channels, ["wse:b", "wse:c"]);
        assert_eq!(letters[1].reason, "down");
        assert!(dead.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_sent_while_disconnected_are_parked_until_stop() {
        let shared = shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Outbound::Frame(frame("wse:broadcast"))).unwrap();

        assert!(!park_until(&shared, &mut rx, Duration::from_secs(1)).await);
        assert_eq!(shared.dead.lock().len(), 1);
        assert_eq!(shared.metrics.publish_failures.load(Ordering::Relaxed), 1);

        tx.send(Outbound::Stop).unwrap();
        assert!(park_until(&shared, &mut rx, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn outlet_fails_while_disconnected_and_once_stopped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(RedisBusMetrics::default());
        let outlet = RedisOutlet {
            tx,
            metrics: metrics.clone(),
        };
        assert!(matches!(
            outlet.publish("wse:heartbeat", "{}".into()),
            Err(GatewayError::ClusterCoordination(_))
        ));
        // queued anyway so the session task can park it
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));

        metrics.connected.store(true, Ordering::Release);
        assert!(outlet.publish("wse:metrics", "{}".into()).is_ok());
        drop(rx);
        assert!(matches!(
            outlet.publish("wse:metrics", "{}".into()),
            Err(GatewayError::ClusterCoordination(_))
        ));
    }
}
