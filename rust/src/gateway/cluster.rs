// =============================================================================
// Cluster coordination: worker lifecycle, heartbeats, load balancing and
// metric aggregation.
//
//   - Each worker publishes a heartbeat on `wse:heartbeat`; the coordinator
//     keeps one WorkerInfo per worker, updated only from those heartbeats
//   - Silent for more than 2x the health interval -> offline, connection
//     count zeroed, restarted unless it was disconnected on purpose
//   - New connections go to the worker the load balancer picks among the
//     online ones; live connections are never migrated
//   - Broadcasts and metrics travel over the bus, never worker-to-worker
// =============================================================================

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::bus::{Alert, AlertLevel, Bus, BusChannel, BusMessage, WorkerHeartbeat};
use super::message::{Envelope, epoch_ms};
use super::queue::SchedulerSnapshot;
use super::reliability::BackoffKind;
use crate::config::ClusterConfig;
use crate::error::GatewayError;

const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Worker records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Online,
    Offline,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub worker_id: usize,
    pub pid: u32,
    pub connections: usize,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub queues: SchedulerSnapshot,
    pub status: WorkerStatus,
    pub restarts: u32,
    #[serde(skip)]
    pub last_heartbeat: Instant,
}

impl WorkerInfo {
    fn starting(worker_id: usize, pid: u32) -> Self {
        Self {
            worker_id,
            pid,
            connections: 0,
            cpu_percent: 0.0,
            memory_bytes: 0,
            queues: SchedulerSnapshot::default(),
            status: WorkerStatus::Starting,
            restarts: 0,
            last_heartbeat: Instant::now(),
        }
    }
}

/// A running worker as seen by its spawner.
pub struct WorkerHandle {
    pub pid: u32,
    /// Cancelling asks the worker to stop accepting and drain.
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Starts workers on behalf of the coordinator.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, worker_id: usize) -> Result<WorkerHandle, GatewayError>;
}

// ---------------------------------------------------------------------------
// Load balancing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    IpHash,
}

/// Picks one worker for a new connection. `online` is in registration order.
pub trait LoadBalancer: Send + Sync {
    fn pick(&self, online: &[WorkerInfo], source: IpAddr) -> Option<usize>;
}

#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn pick(&self, online: &[WorkerInfo], _source: IpAddr) -> Option<usize> {
        if online.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(online[n % online.len()].worker_id)
    }
}

pub struct LeastConnections;

impl LoadBalancer for LeastConnections {
    fn pick(&self, online: &[WorkerInfo], _source: IpAddr) -> Option<usize> {
        online
            .iter()
            .min_by_key(|w| w.connections)
            .map(|w| w.worker_id)
    }
}

pub struct IpHash;

impl IpHash {
    fn hash(source: IpAddr) -> u64 {
        let digest = Sha256::digest(source.to_string().as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }
}

impl LoadBalancer for IpHash {
    fn pick(&self, online: &[WorkerInfo], source: IpAddr) -> Option<usize> {
        if online.is_empty() {
            return None;
        }
        let idx = (Self::hash(source) % online.len() as u64) as usize;
        Some(online[idx].worker_id)
    }
}

pub fn balancer_for(strategy: LoadBalancingStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Box::new(RoundRobin::default()),
        LoadBalancingStrategy::LeastConnections => Box::new(LeastConnections),
        LoadBalancingStrategy::IpHash => Box::new(IpHash),
    }
}

// ---------------------------------------------------------------------------
// Events + metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    WorkerStarted(usize),
    WorkerOnline(usize),
    WorkerOffline(usize),
    WorkerRestarted { worker_id: usize, restarts: u32 },
    Alert(Alert),
    ShuttingDown,
}

#[derive(Default)]
pub struct CoordinatorMetrics {
    pub heartbeats: AtomicU64,
    pub restarts: AtomicU64,
    pub alerts: AtomicU64,
    pub coordination_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub instance_id: String,
    pub strategy: LoadBalancingStrategy,
    pub online_workers: usize,
    pub total_connections: usize,
    pub queued_messages: usize,
    pub workers: Vec<WorkerInfo>,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct WorkerSlot {
    info: WorkerInfo,
    handle: Option<WorkerHandle>,
    /// Deliberately stopped; never restarted.
    disconnecting: bool,
    /// Consecutive failed restarts and when the next one may run.
    restart_failures: u32,
    retry_at: Option<Instant>,
}

pub struct ClusterCoordinator {
    bus: Arc<Bus>,
    spawner: Arc<dyn WorkerSpawner>,
    balancer: Box<dyn LoadBalancer>,
    strategy: LoadBalancingStrategy,
    worker_count: usize,
    health_interval: Duration,
    metrics_interval: Duration,
    workers: Mutex<Vec<WorkerSlot>>,
    accepting: AtomicBool,
    events: broadcast::Sender<ClusterEvent>,
    pub metrics: CoordinatorMetrics,
}

impl ClusterCoordinator {
    pub fn new(bus: Arc<Bus>, spawner: Arc<dyn WorkerSpawner>, config: &ClusterConfig) -> Self {
        let strategy = config.load_balancing.strategy;
        let (events, _) = broadcast::channel(256);
        Self {
            bus,
            spawner,
            balancer: balancer_for(strategy),
            strategy,
            worker_count: config.workers.max(1),
            health_interval: config.health_check_interval(),
            metrics_interval: config.metrics_interval(),
            workers: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            events,
            metrics: CoordinatorMetrics::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Bus name of a worker's point-to-point channel.
    pub fn worker_channel(&self, worker_id: usize) -> BusChannel {
        worker_channel(self.bus.instance_id(), worker_id)
    }

    /// Spawn the configured number of workers.
    pub fn start(&self) -> Result<(), GatewayError> {
        let mut workers = self.workers.lock();
        for worker_id in workers.len()..self.worker_count {
            let handle = self.spawner.spawn(worker_id)?;
            workers.push(WorkerSlot {
                info: WorkerInfo::starting(worker_id, handle.pid),
                handle: Some(handle),
                disconnecting: false,
                restart_failures: 0,
                retry_at: None,
            });
            let _ = self.events.send(ClusterEvent::WorkerStarted(worker_id));
        }
        tracing::info!(
            workers = self.worker_count,
            strategy = ?self.strategy,
            "cluster started"
        );
        Ok(())
    }

    pub fn handle_heartbeat(&self, hb: &WorkerHeartbeat) {
        self.metrics.heartbeats.fetch_add(1, Ordering::Relaxed);
        let mut workers = self.workers.lock();
        let Some(slot) = workers.iter_mut().find(|s| s.info.worker_id == hb.worker_id) else {
            tracing::debug!(worker_id = hb.worker_id, "heartbeat from unknown worker");
            return;
        };
        let info = &mut slot.info;
        info.pid = hb.pid;
        info.connections = hb.connections;
        info.cpu_percent = hb.cpu_percent;
        info.memory_bytes = hb.memory_bytes;
        info.queues = hb.queues.clone();
        info.last_heartbeat = Instant::now();
        if matches!(info.status, WorkerStatus::Starting | WorkerStatus::Offline) {
            info.status = WorkerStatus::Online;
            slot.restart_failures = 0;
            slot.retry_at = None;
            let _ = self.events.send(ClusterEvent::WorkerOnline(hb.worker_id));
        }
    }

    /// Mark silent workers offline and restart them; offline workers whose
    /// restart failed are retried once their backoff has passed. Returns the
    /// restarted ids.
    pub fn check_health(&self) -> Vec<usize> {
        let limit = self.health_interval * 2;
        let now = Instant::now();
        let mut restarted = Vec::new();
        let mut alerts = Vec::new();
        {
            let mut workers = self.workers.lock();
            for slot in workers.iter_mut() {
                if slot.disconnecting {
                    continue;
                }
                let worker_id = slot.info.worker_id;
                match slot.info.status {
                    WorkerStatus::Offline if slot.retry_at.is_some_and(|at| now >= at) => {}
                    WorkerStatus::Starting | WorkerStatus::Online => {
                        let silent = now.duration_since(slot.info.last_heartbeat);
                        if silent <= limit {
                            continue;
                        }
                        slot.info.status = WorkerStatus::Offline;
                        slot.info.connections = 0;
                        let _ = self.events.send(ClusterEvent::WorkerOffline(worker_id));
                        tracing::warn!(worker_id, silent_ms = silent.as_millis() as u64, "worker missed heartbeats");
                    }
                    _ => continue,
                }
                if let Some(old) = slot.handle.take() {
                    old.cancel.cancel();
                    old.task.abort();
                }

                match self.spawner.spawn(worker_id) {
                    Ok(handle) => {
                        slot.info.pid = handle.pid;
                        slot.info.status = WorkerStatus::Starting;
                        slot.info.last_heartbeat = now;
                        slot.info.restarts += 1;
                        slot.handle = Some(handle);
                        slot.restart_failures = 0;
                        slot.retry_at = None;
                        self.metrics.restarts.fetch_add(1, Ordering::Relaxed);
                        let _ = self.events.send(ClusterEvent::WorkerRestarted {
                            worker_id,
                            restarts: slot.info.restarts,
                        });
                        alerts.push((
                            AlertLevel::Warning,
                            worker_id,
                            format!("worker {worker_id} restarted after missing heartbeats"),
                        ));
                        restarted.push(worker_id);
                    }
                    Err(e) => {
                        self.metrics
                            .coordination_errors
                            .fetch_add(1, Ordering::Relaxed);
                        slot.restart_failures = slot.restart_failures.saturating_add(1);
                        let wait = BackoffKind::Exponential.delay(
                            slot.restart_failures,
                            self.health_interval,
                            MAX_RESTART_BACKOFF,
                        );
                        slot.retry_at = Some(now + wait);
                        tracing::warn!(
                            worker_id,
                            failures = slot.restart_failures,
                            retry_in_ms = wait.as_millis() as u64,
                            error = %e,
                            "worker restart failed"
                        );
                        if slot.restart_failures == 1 {
                            alerts.push((
                                AlertLevel::Critical,
                                worker_id,
                                format!("worker {worker_id} offline, restart failed: {e}"),
                            ));
                        }
                    }
                }
            }
        }
        for (level, worker_id, message) in alerts {
            self.raise_alert(level, Some(worker_id), message);
        }
        restarted
    }

    /// Worker for a new connection, or `None` when nothing can take it.
    pub fn pick_worker(&self, source: IpAddr) -> Option<usize> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        let online: Vec<WorkerInfo> = self
            .workers
            .lock()
            .iter()
            .filter(|s| s.info.status == WorkerStatus::Online)
            .map(|s| s.info.clone())
            .collect();
        self.balancer.pick(&online, source)
    }

    /// Relay `envelope` to every matching connection on every worker.
    pub fn broadcast(&self, filter: Value, envelope: Envelope) -> Result<(), GatewayError> {
        self.publish(&BusChannel::Broadcast, &BusMessage::Broadcast { filter, envelope })
    }

    pub fn send_to_worker(
        &self,
        worker_id: usize,
        filter: Value,
        envelope: Envelope,
    ) -> Result<(), GatewayError> {
        self.publish(
            &self.worker_channel(worker_id),
            &BusMessage::Deliver { filter, envelope },
        )
    }

    fn publish(&self, channel: &BusChannel, message: &BusMessage) -> Result<(), GatewayError> {
        self.bus.publish(channel, message).inspect_err(|e| {
            self.metrics
                .coordination_errors
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(channel = %channel.name(), error = %e, "cluster publish failed");
        })
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers.lock().iter().map(|s| s.info.clone()).collect()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let workers = self.workers();
        let online: Vec<&WorkerInfo> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Online)
            .collect();
        ClusterSnapshot {
            instance_id: self.bus.instance_id().to_string(),
            strategy: self.strategy,
            online_workers: online.len(),
            total_connections: online.iter().map(|w| w.connections).sum(),
            queued_messages: online.iter().map(|w| w.queues.queued_messages).sum(),
            timestamp: epoch_ms(),
            workers,
        }
    }

    pub fn publish_metrics(&self) -> Result<ClusterSnapshot, GatewayError> {
        let snapshot = self.snapshot();
        let value = serde_json::to_value(&snapshot)
            .map_err(|e| GatewayError::ClusterCoordination(e.to_string()))?;
        self.publish(&BusChannel::Metrics, &BusMessage::Metrics { snapshot: value })?;
        Ok(snapshot)
    }

    /// Publish an alert on the metrics channel and the local event stream.
    /// A failed publish is logged only.
    pub fn raise_alert(&self, level: AlertLevel, worker_id: Option<usize>, message: String) {
        let alert = Alert {
            level,
            worker_id,
            message,
            timestamp: epoch_ms(),
        };
        self.metrics.alerts.fetch_add(1, Ordering::Relaxed);
        let _ = self.publish(&BusChannel::Metrics, &BusMessage::Alert(alert.clone()));
        let _ = self.events.send(ClusterEvent::Alert(alert));
    }

    /// Stop one worker on purpose. It will not be restarted.
    pub fn disconnect_worker(&self, worker_id: usize) -> bool {
        let mut workers = self.workers.lock();
        let Some(slot) = workers.iter_mut().find(|s| s.info.worker_id == worker_id) else {
            return false;
        };
        slot.disconnecting = true;
        slot.info.status = WorkerStatus::Stopping;
        if let Some(handle) = &slot.handle {
            handle.cancel.cancel();
        }
        tracing::info!(worker_id, "worker disconnect requested");
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting, let workers drain for up to `timeout`, then abort
    /// whatever is still running. Returns how many workers were forced.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.accepting.store(false, Ordering::Release);
        let _ = self.events.send(ClusterEvent::ShuttingDown);
        let _ = self.publish(
            &BusChannel::Control,
            &BusMessage::Shutdown {
                drain_ms: timeout.as_millis() as u64,
            },
        );

        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            workers
                .iter_mut()
                .filter_map(|slot| {
                    slot.disconnecting = true;
                    slot.info.status = WorkerStatus::Stopping;
                    slot.handle.take()
                })
                .collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }

        let mut tasks: Vec<JoinHandle<()>> = handles.into_iter().map(|h| h.task).collect();
        let drained = tokio::time::timeout(timeout, join_all(tasks.iter_mut())).await;
        let forced = match drained {
            Ok(_) => 0,
            Err(_) => {
                let stragglers: Vec<&JoinHandle<()>> =
                    tasks.iter().filter(|t| !t.is_finished()).collect();
                for task in &stragglers {
                    task.abort();
                }
                stragglers.len()
            }
        };
        tracing::info!(forced, "cluster stopped");
        forced
    }

    /// Heartbeat intake, health checks and metric publishing until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut inbound = self.bus.subscribe();
        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics = tokio::time::interval(self.metrics_interval);
        metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                delivery = inbound.recv() => match delivery {
                    Ok(delivery) => {
                        if delivery.origin != self.bus.instance_id() {
                            continue;
                        }
                        if let BusMessage::Heartbeat(hb) = &delivery.message {
                            self.handle_heartbeat(hb);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "coordinator lagging behind bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = health.tick() => {
                    self.check_health();
                }
                _ = metrics.tick() => {
                    let _ = self.publish_metrics();
                }
                () = cancel.cancelled() => break,
            }
        }
    }
}

pub fn worker_channel(instance_id: &str, worker_id: usize) -> BusChannel {
    BusChannel::Worker(format!("{instance_id}-{worker_id}"))
}
