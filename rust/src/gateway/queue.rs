// =============================================================================
// Per-connection priority queues and the batch scheduler that drains them.
//
//   - Ordering: priority descending, then arrival ascending (FIFO per level)
//   - Bounded: when full the oldest entry of the lowest priority present is
//     dropped, which may be the incoming message itself; drops are counted
//   - `critical` messages skip the queue and are handled inline
//   - Each tick drains at most `batch_size` messages per connection
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::message::{Envelope, Priority};

/// Consumer of drained (and bypassing) messages.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, conn_id: &'a str, msg: Envelope) -> BoxFuture<'a, ()>;
}

// ---------------------------------------------------------------------------
// PriorityMessageQueue
// ---------------------------------------------------------------------------

struct MessageEntry {
    enqueued_at: Instant,
    msg: Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
    /// Indexed by `Priority::index()`.
    pub depths: [usize; Priority::LEVELS],
    pub dropped_by_priority: [u64; Priority::LEVELS],
    pub total_dropped: u64,
    /// More than 80% full.
    pub backpressure: bool,
    pub oldest_message_age: Option<Duration>,
}

/// Bounded queue with one FIFO per priority level.
pub struct PriorityMessageQueue {
    queues: [VecDeque<MessageEntry>; Priority::LEVELS],
    max_size: usize,
    size: usize,
    dropped: [u64; Priority::LEVELS],
}

impl PriorityMessageQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queues: Default::default(),
            max_size: max_size.max(1),
            size: 0,
            dropped: [0; Priority::LEVELS],
        }
    }

    /// Insert keeping priority/arrival order. Returns false if the message
    /// itself was the drop victim.
    pub fn enqueue(&mut self, msg: Envelope) -> bool {
        let priority = msg.priority();

        if self.size >= self.max_size {
            let lowest = Priority::DESCENDING
                .iter()
                .rev()
                .copied()
                .find(|p| !self.queues[p.index()].is_empty());
            match lowest {
                Some(victim) if victim <= priority => {
                    self.queues[victim.index()].pop_front();
                    self.size -= 1;
                    self.dropped[victim.index()] += 1;
                }
                _ => {
                    self.dropped[priority.index()] += 1;
                    return false;
                }
            }
        }

        self.queues[priority.index()].push_back(MessageEntry {
            enqueued_at: Instant::now(),
            msg,
        });
        self.size += 1;
        true
    }

    /// Remove up to `max` messages, highest priority first.
    pub fn dequeue_batch(&mut self, max: usize) -> Vec<Envelope> {
        let mut batch = Vec::with_capacity(max.min(self.size));
        for priority in Priority::DESCENDING {
            let queue = &mut self.queues[priority.index()];
            while batch.len() < max {
                match queue.pop_front() {
                    Some(entry) => batch.push(entry.msg),
                    None => break,
                }
            }
        }
        self.size -= batch.len();
        batch
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn clear(&mut self) -> usize {
        let discarded = self.size;
        for q in &mut self.queues {
            q.clear();
        }
        self.size = 0;
        discarded
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.iter().sum()
    }

    pub fn stats(&self) -> QueueStats {
        let mut depths = [0usize; Priority::LEVELS];
        for (depth, q) in depths.iter_mut().zip(self.queues.iter()) {
            *depth = q.len();
        }
        let oldest = self
            .queues
            .iter()
            .filter_map(|q| q.front().map(|e| e.enqueued_at))
            .min();
        QueueStats {
            size: self.size,
            capacity: self.max_size,
            utilization_percent: self.size as f64 / self.max_size as f64 * 100.0,
            depths,
            dropped_by_priority: self.dropped,
            total_dropped: self.total_dropped(),
            backpressure: self.size as f64 > self.max_size as f64 * 0.8,
            oldest_message_age: oldest.map(|t| t.elapsed()),
        }
    }
}

// ---------------------------------------------------------------------------
// BatchScheduler
// ---------------------------------------------------------------------------

struct ConnQueue {
    queue: Mutex<PriorityMessageQueue>,
    processing: AtomicBool,
}

/// Clears the processing flag when a drain pass ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct SchedulerMetrics {
    pub enqueued: AtomicU64,
    pub dispatched: AtomicU64,
    pub critical_bypass: AtomicU64,
    pub dropped: AtomicU64,
    pub ticks: AtomicU64,
}

/// Aggregate queue figures for worker heartbeats.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub queues: usize,
    pub queued_messages: usize,
    pub dropped_messages: u64,
    pub backpressured_connections: usize,
}

pub struct BatchScheduler {
    queues: DashMap<String, Arc<ConnQueue>>,
    handler: Arc<dyn MessageHandler>,
    max_size: usize,
    batch_size: usize,
    interval: Duration,
    pub metrics: SchedulerMetrics,
}

impl BatchScheduler {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        max_size: usize,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            queues: DashMap::new(),
            handler,
            max_size,
            batch_size: batch_size.max(1),
            interval,
            metrics: SchedulerMetrics::default(),
        }
    }

    /// Queue a message for `conn_id`. Critical messages are handled before
    /// this returns. Returns false when the message was dropped.
    pub async fn enqueue(&self, conn_id: &str, msg: Envelope) -> bool {
        if msg.priority() == Priority::Critical {
            self.metrics.critical_bypass.fetch_add(1, Ordering::Relaxed);
            self.handler.handle(conn_id, msg).await;
            self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let entry = self
            .queues
            .entry(conn_id.to_string())
            .or_insert_with(|| {
                Arc::new(ConnQueue {
                    queue: Mutex::new(PriorityMessageQueue::new(self.max_size)),
                    processing: AtomicBool::new(false),
                })
            })
            .clone();

        let (accepted, dropped) = {
            let mut queue = entry.queue.lock();
            let before = queue.total_dropped();
            let accepted = queue.enqueue(msg);
            (accepted, queue.total_dropped() - before)
        };
        if dropped > 0 {
            self.metrics.dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::debug!(conn_id, accepted, "connection queue full, dropped lowest priority");
        }
        if accepted {
            self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// One scheduler pass: every non-empty queue hands at most `batch_size`
    /// messages to the handler, in queue order. Queues already being drained
    /// by a concurrent pass are skipped.
    pub async fn drain_tick(&self) {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let ready: Vec<(String, Arc<ConnQueue>)> = self
            .queues
            .iter()
            .filter(|e| !e.value().queue.lock().is_empty())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        join_all(ready.into_iter().map(|(conn_id, cq)| async move {
            if cq
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let _guard = ProcessingGuard(&cq.processing);
            let batch = cq.queue.lock().dequeue_batch(self.batch_size);
            for msg in batch {
                self.handler.handle(&conn_id, msg).await;
                self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
            }
        }))
        .await;
    }

    /// Discard a closed connection's queue. Returns how many messages were dropped.
    pub fn remove_queue(&self, conn_id: &str) -> usize {
        self.queues
            .remove(conn_id)
            .map(|(_, cq)| cq.queue.lock().clear())
            .unwrap_or(0)
    }

    pub fn queue_len(&self, conn_id: &str) -> usize {
        self.queues
            .get(conn_id)
            .map(|cq| cq.queue.lock().len())
            .unwrap_or(0)
    }

    pub fn queue_stats(&self, conn_id: &str) -> Option<QueueStats> {
        self.queues.get(conn_id).map(|cq| cq.queue.lock().stats())
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut snap = SchedulerSnapshot {
            queues: self.queues.len(),
            dropped_messages: self.metrics.dropped.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.queues.iter() {
            let stats = entry.value().queue.lock().stats();
            snap.queued_messages += stats.size;
            if stats.backpressure {
                snap.backpressured_connections += 1;
            }
        }
        snap
    }

    /// Drain on a fixed interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain_tick().await,
                () = cancel.cancelled() => break,
            }
        }
    }
}
