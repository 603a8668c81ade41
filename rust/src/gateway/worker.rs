// =============================================================================
// Worker: one independently scheduled unit of the cluster.
//
// Each worker owns its connections, registry, per-connection queues and
// batch scheduler. Admission, the command dispatcher, device links and the
// bus are shared services handed in at construction.
//
//   - heartbeat task   publishes connection count, CPU, memory and queue
//                      figures on wse:heartbeat every health interval
//   - bus listener     applies broadcasts, worker-directed deliveries and
//                      shutdown requests
//   - inbox            accepted TCP streams steered here by the acceptor
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::admission::AdmissionController;
use super::bus::{Bus, BusChannel, BusMessage, Delivery, WorkerHeartbeat};
use super::cluster::{WorkerHandle, WorkerSpawner, worker_channel};
use super::compression::PayloadCodec;
use super::dedup::DedupWindow;
use super::dispatcher::CommandDispatcher;
use super::message::{self, Envelope, epoch_ms};
use super::queue::BatchScheduler;
use super::registry::{Connection, ConnectionRegistry};
use super::router::Router;
use super::transport::DeviceLinks;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::jwt::ClientRole;

const DEDUP_WINDOW: usize = 10_000;
const DEDUP_MAX_AGE: Duration = Duration::from_secs(300);
const INBOX_CAPACITY: usize = 1024;

/// Services shared by every worker in the process.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<GatewayConfig>,
    pub admission: Arc<AdmissionController>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub links: Arc<DeviceLinks>,
    pub bus: Arc<Bus>,
}

/// An accepted TCP stream on its way to a worker.
pub struct Incoming {
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

#[derive(Default)]
pub struct WorkerMetrics {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub messages_in: AtomicU64,
    pub rate_limited: AtomicU64,
    pub duplicates: AtomicU64,
    pub invalid: AtomicU64,
    pub queue_rejected: AtomicU64,
    pub broadcast_delivered: AtomicU64,
    pub broadcast_dropped: AtomicU64,
}

pub struct Worker {
    pub id: usize,
    services: Services,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<BatchScheduler>,
    codec: PayloadCodec,
    dedup: Mutex<DedupWindow>,
    pub metrics: WorkerMetrics,
}

impl Worker {
    pub fn new(id: usize, services: Services) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(
            registry.clone(),
            services.dispatcher.clone(),
            services.links.clone(),
            services.bus.clone(),
        ));
        let queue = &services.config.queue;
        let scheduler = Arc::new(BatchScheduler::new(
            router,
            queue.max_size,
            queue.batch_size,
            queue.batch_interval(),
        ));
        let compression = &services.config.compression;
        Arc::new(Self {
            id,
            codec: PayloadCodec::new(compression.threshold_bytes, compression.level),
            services,
            registry,
            scheduler,
            dedup: Mutex::new(DedupWindow::new(DEDUP_WINDOW)),
            metrics: WorkerMetrics::default(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    pub fn channel(&self) -> BusChannel {
        worker_channel(self.services.bus.instance_id(), self.id)
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register an admitted connection. Device-role connections become the
    /// command link for their device.
    pub fn open(&self, conn: Arc<Connection>) -> bool {
        if !self.registry.register(conn.clone()) {
            return false;
        }
        self.metrics
            .connections_opened
            .fetch_add(1, Ordering::Relaxed);
        if conn.role == ClientRole::Device
            && let Some(device_id) = conn.device_id.as_deref()
        {
            self.services.links.attach(device_id, conn.clone());
            self.services.dispatcher.device_online(device_id);
        }
        tracing::info!(
            worker_id = self.id,
            conn_id = %conn.id,
            user_id = %conn.user_id,
            region = %conn.region,
            "connection opened"
        );
        true
    }

    /// Tear down a closed connection: tied commands are cancelled, queued
    /// messages discarded, indexes cleared and the capacity slot returned.
    /// Runs once per connection, even when a failed send already dropped it
    /// from the registry.
    pub fn close(&self, conn: &Arc<Connection>) {
        if !conn.begin_teardown() {
            return;
        }
        for command_id in conn.take_tied_commands() {
            self.services.dispatcher.cancel_command(&command_id);
        }
        let discarded = self.scheduler.remove_queue(&conn.id);
        self.registry.unregister(&conn.id);
        if conn.role == ClientRole::Device
            && let Some(device_id) = conn.device_id.as_deref()
            && self.services.links.detach(device_id, &conn.id)
        {
            self.services.dispatcher.device_offline(device_id);
        }
        self.services.admission.release();
        self.metrics
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(worker_id = self.id, conn_id = %conn.id, discarded, "connection closed");
    }

    /// One inbound text frame: rate check, parse, inflate, duplicate check,
    /// then the connection's queue (or straight to the router when critical).
    pub async fn ingest(&self, conn: &Connection, text: &str) {
        self.metrics.messages_in.fetch_add(1, Ordering::Relaxed);
        if !self.services.admission.check_rate(conn) {
            self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.reply(conn, &message::error(&GatewayError::RateLimitExceeded, None));
            return;
        }

        let mut msg = match Envelope::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.invalid.fetch_add(1, Ordering::Relaxed);
                self.reply(conn, &message::error(&e, None));
                return;
            }
        };
        if let Err(e) = self.codec.inflate(&mut msg) {
            self.metrics.invalid.fetch_add(1, Ordering::Relaxed);
            self.reply(conn, &message::error(&e, Some(&msg.id)));
            return;
        }
        if self
            .dedup
            .lock()
            .is_duplicate(&format!("{}:{}", conn.id, msg.id))
        {
            self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            self.reply(
                conn,
                &message::error_code("DUPLICATE_MESSAGE", "message already processed", Some(&msg.id)),
            );
            return;
        }
        conn.record_received(msg.timestamp);

        let id = msg.id.clone();
        if !self.scheduler.enqueue(&conn.id, msg).await {
            self.metrics.queue_rejected.fetch_add(1, Ordering::Relaxed);
            self.reply(
                conn,
                &message::error(&GatewayError::QueueFull(conn.id.clone()), Some(&id)),
            );
        }
    }

    fn reply(&self, conn: &Connection, env: &Envelope) {
        if self.registry.send_to(&conn.id, env).is_err() {
            tracing::debug!(conn_id = %conn.id, "reply dropped, connection closed");
        }
    }

    // -----------------------------------------------------------------------
    // Bus
    // -----------------------------------------------------------------------

    /// Apply one bus delivery. Returns true when it asks this worker to stop.
    pub fn apply(&self, delivery: &Delivery) -> bool {
        match &delivery.message {
            BusMessage::Broadcast { filter, envelope } => {
                self.deliver_matching(filter, envelope);
                false
            }
            BusMessage::Deliver { filter, envelope } => {
                if delivery.channel == self.channel() {
                    self.deliver_matching(filter, envelope);
                }
                false
            }
            BusMessage::Shutdown { drain_ms } => {
                let own = delivery.origin == self.services.bus.instance_id();
                if own {
                    tracing::info!(worker_id = self.id, drain_ms, "shutdown requested");
                }
                own
            }
            BusMessage::Heartbeat(_) | BusMessage::Metrics { .. } | BusMessage::Alert(_) => false,
        }
    }

    fn deliver_matching(&self, filter: &serde_json::Value, envelope: &Envelope) {
        let targets = self.registry.matching(filter);
        if targets.is_empty() {
            return;
        }
        let (delivered, dropped) = self.registry.deliver(&targets, envelope);
        self.metrics
            .broadcast_delivered
            .fetch_add(delivered, Ordering::Relaxed);
        self.metrics
            .broadcast_dropped
            .fetch_add(dropped, Ordering::Relaxed);
        tracing::debug!(worker_id = self.id, delivered, dropped, msg_type = %envelope.msg_type, "broadcast applied");
    }

    pub fn heartbeat(&self, probe: &mut ProcessProbe) -> WorkerHeartbeat {
        let (cpu_percent, memory_bytes) = probe.sample();
        WorkerHeartbeat {
            worker_id: self.id,
            pid: std::process::id(),
            connections: self.registry.len(),
            cpu_percent,
            memory_bytes,
            queues: self.scheduler.snapshot(),
            timestamp: epoch_ms(),
        }
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    async fn heartbeat_task(self: Arc<Self>, cancel: CancellationToken) {
        let mut probe = ProcessProbe::new();
        let mut ticker = tokio::time::interval(self.services.config.cluster.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let hb = self.heartbeat(&mut probe);
                    if let Err(e) = self
                        .services
                        .bus
                        .publish(&BusChannel::Heartbeat, &BusMessage::Heartbeat(hb))
                    {
                        tracing::warn!(worker_id = self.id, error = %e, "heartbeat publish failed");
                    }
                    self.dedup.lock().cleanup(DEDUP_MAX_AGE);
                    self.services.admission.sweep();
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    async fn bus_task(
        self: Arc<Self>,
        mut inbound: broadcast::Receiver<Arc<Delivery>>,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                delivery = inbound.recv() => match delivery {
                    Ok(delivery) => {
                        if self.apply(&delivery) {
                            stop.cancel();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(worker_id = self.id, skipped = n, "worker lagging behind bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = cancel.cancelled() => break,
            }
        }
    }

    /// Serve connections from `inbox` until `stop` fires, then close every
    /// connection and wait for them to finish.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Incoming>, stop: CancellationToken) {
        let background = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(self.scheduler.clone().run(background.clone()));
        tasks.spawn(self.clone().heartbeat_task(background.clone()));
        tasks.spawn(self.clone().bus_task(
            self.services.bus.subscribe(),
            stop.clone(),
            background.clone(),
        ));
        tracing::info!(worker_id = self.id, "worker started");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                incoming = inbox.recv() => match incoming {
                    Some(Incoming { stream, addr }) => {
                        connections.spawn(super::server::serve_connection(self.clone(), stream, addr));
                    }
                    None => break,
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                () = stop.cancelled() => break,
            }
        }
        drop(inbox);

        let open = self.registry.len();
        tracing::info!(worker_id = self.id, open, "worker draining");
        for conn in self.registry.snapshot() {
            conn.close();
        }
        while connections.join_next().await.is_some() {}

        background.cancel();
        while tasks.join_next().await.is_some() {}
        tracing::info!(worker_id = self.id, "worker stopped");
    }
}

/// Closes an open connection when dropped, so a serving task that is
/// aborted mid-read still returns its slot and device link.
pub struct ConnectionTeardown {
    worker: Arc<Worker>,
    conn: Arc<Connection>,
}

impl ConnectionTeardown {
    pub fn new(worker: Arc<Worker>, conn: Arc<Connection>) -> Self {
        Self { worker, conn }
    }
}

impl Drop for ConnectionTeardown {
    fn drop(&mut self) {
        self.worker.close(&self.conn);
        self.conn.close();
    }
}

/// CPU and memory of the hosting process.
pub struct ProcessProbe {
    system: System,
    pid: Option<Pid>,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// (cpu percent, resident bytes). Zeros when the process is not visible.
    pub fn sample(&mut self) -> (f32, u64) {
        let Some(pid) = self.pid else {
            return (0.0, 0);
        };
        self.system.refresh_process(pid);
        self.system
            .process(pid)
            .map(|p| (p.cpu_usage(), p.memory()))
            .unwrap_or((0.0, 0))
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// In-process spawner
// ---------------------------------------------------------------------------

/// Runs workers as tokio tasks and keeps their inboxes for the acceptor.
pub struct LocalWorkerSpawner {
    services: Services,
    inboxes: DashMap<usize, mpsc::Sender<Incoming>>,
    workers: DashMap<usize, Arc<Worker>>,
}

impl LocalWorkerSpawner {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            inboxes: DashMap::new(),
            workers: DashMap::new(),
        }
    }

    pub fn worker(&self, worker_id: usize) -> Option<Arc<Worker>> {
        self.workers.get(&worker_id).map(|w| w.clone())
    }

    /// Hand an accepted stream to a worker. The stream comes back when the
    /// worker's inbox is full or gone.
    pub fn route(&self, worker_id: usize, incoming: Incoming) -> Result<(), Incoming> {
        let Some(inbox) = self.inboxes.get(&worker_id).map(|i| i.clone()) else {
            return Err(incoming);
        };
        inbox.try_send(incoming).map_err(|e| match e {
            mpsc::error::TrySendError::Full(incoming) | mpsc::error::TrySendError::Closed(incoming) => {
                incoming
            }
        })
    }
}

impl WorkerSpawner for LocalWorkerSpawner {
    fn spawn(&self, worker_id: usize) -> Result<WorkerHandle, GatewayError> {
        let worker = Worker::new(worker_id, self.services.clone());
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.clone().run(rx, cancel.clone()));
        self.inboxes.insert(worker_id, tx);
        self.workers.insert(worker_id, worker);
        Ok(WorkerHandle {
            pid: std::process::id(),
            cancel,
            task,
        })
    }
}
