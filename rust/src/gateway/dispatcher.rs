// =============================================================================
// Command dispatcher: per-device bounded concurrency with retry and offline
// queueing.
//
//   Created -> Queued -> Executing -> Completed | Failed | Cancelled
//
//   - At most `max_concurrent_per_device` commands execute per device
//   - Busy (or offline with queue_if_offline) devices queue commands, ordered
//     by priority then arrival; a full queue rejects without blocking
//   - Each caller is settled exactly once through a oneshot channel
//   - Cancellation is cooperative: checked around each attempt and backoff
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dedup::OutcomeCache;
use super::message::Priority;
use super::reliability::RetryPolicy;
use crate::config::DispatcherConfig;
use crate::error::GatewayError;

/// The device-side half of command execution.
pub trait DeviceTransport: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        device_id: &'a str,
        command_id: &'a str,
        command: Value,
    ) -> BoxFuture<'a, Result<Value, GatewayError>>;
}

#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_queue_size: usize,
    pub priority: Priority,
    pub queue_if_offline: bool,
}

impl CommandOptions {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.default_timeout_ms),
            retry: RetryPolicy::from_config(&config.retry_strategy),
            max_queue_size: config.max_queue_size,
            priority: Priority::Normal,
            queue_if_offline: config.queue_if_offline,
        }
    }
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command_id: String,
    pub device_id: String,
    pub result: Value,
    pub attempts: u32,
    pub duration: Duration,
}

pub type CommandResult = Result<CommandOutcome, GatewayError>;

/// Where a command stood when `submit` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Dispatched,
    Queued,
    /// The id had already completed; the ticket carries the cached outcome.
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Queued,
    Executing,
    Completed,
    Failed,
}

/// Handed back by `submit`; resolves once with the command's outcome.
pub struct CommandTicket {
    pub command_id: String,
    pub device_id: String,
    pub state: TicketState,
    rx: oneshot::Receiver<CommandResult>,
}

impl CommandTicket {
    pub async fn wait(self) -> CommandResult {
        self.rx.await.unwrap_or(Err(GatewayError::Cancelled))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Online(String),
    Offline(String),
    Removed(String),
    CommandCompleted {
        device_id: String,
        command_id: String,
        attempts: u32,
    },
    CommandFailed {
        device_id: String,
        command_id: String,
        error: GatewayError,
    },
    Telemetry {
        device_id: String,
        event: String,
        data: Value,
    },
}

#[derive(Default)]
pub struct DispatcherMetrics {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub cancelled: AtomicU64,
    pub rejected: AtomicU64,
    pub duplicates: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub online: bool,
    pub executing: usize,
    pub queued: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct CommandContext {
    command_id: String,
    device_id: String,
    command: Value,
    options: CommandOptions,
    attempts: AtomicU32,
    created_at: Instant,
    cancel: CancellationToken,
    done: Mutex<Option<oneshot::Sender<CommandResult>>>,
}

#[derive(Default)]
struct DeviceSlot {
    online: bool,
    executing: HashMap<String, Arc<CommandContext>>,
    queue: VecDeque<Arc<CommandContext>>,
}

impl DeviceSlot {
    /// Insert after every queued command of equal or higher priority.
    fn enqueue(&mut self, ctx: Arc<CommandContext>) {
        let pos = self
            .queue
            .iter()
            .position(|queued| queued.options.priority < ctx.options.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, ctx);
    }

    fn take_queued(&mut self, command_id: &str) -> Option<Arc<CommandContext>> {
        let pos = self
            .queue
            .iter()
            .position(|ctx| ctx.command_id == command_id)?;
        self.queue.remove(pos)
    }
}

pub struct CommandDispatcher {
    transport: Arc<dyn DeviceTransport>,
    max_concurrent: usize,
    defaults: CommandOptions,
    devices: DashMap<String, Arc<Mutex<DeviceSlot>>>,
    /// Active (queued or executing) command id -> device id.
    active: DashMap<String, String>,
    completed: Mutex<OutcomeCache<CommandResult>>,
    events: broadcast::Sender<DeviceEvent>,
    pub metrics: DispatcherMetrics,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn DeviceTransport>, config: &DispatcherConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            transport,
            max_concurrent: config.max_concurrent_per_device.max(1),
            defaults: CommandOptions::from_config(config),
            devices: DashMap::new(),
            active: DashMap::new(),
            completed: Mutex::new(OutcomeCache::new(config.completed_cache_size)),
            events,
            metrics: DispatcherMetrics::default(),
        }
    }

    pub fn default_options(&self) -> CommandOptions {
        self.defaults.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn slot(&self, device_id: &str) -> Arc<Mutex<DeviceSlot>> {
        self.devices
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Accept a command for execution or queueing. Never waits on the device:
    /// the returned ticket resolves when the command settles.
    pub fn submit(
        self: &Arc<Self>,
        device_id: &str,
        command_id: &str,
        command: Value,
        options: CommandOptions,
    ) -> Result<CommandTicket, GatewayError> {
        if let Some(cached) = self.completed.lock().get(command_id) {
            self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(cached);
            return Ok(CommandTicket {
                command_id: command_id.to_string(),
                device_id: device_id.to_string(),
                state: TicketState::Cached,
                rx,
            });
        }

        match self.active.entry(command_id.to_string()) {
            Entry::Occupied(_) => {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                return Err(GatewayError::DuplicateCommand(command_id.to_string()));
            }
            Entry::Vacant(v) => {
                v.insert(device_id.to_string());
            }
        }

        let (tx, rx) = oneshot::channel();
        let ctx = Arc::new(CommandContext {
            command_id: command_id.to_string(),
            device_id: device_id.to_string(),
            command,
            options,
            attempts: AtomicU32::new(0),
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            done: Mutex::new(Some(tx)),
        });

        let slot = self.slot(device_id);
        let mut slot = slot.lock();
        let state = if slot.online && slot.executing.len() < self.max_concurrent {
            self.start(&mut slot, ctx);
            TicketState::Dispatched
        } else if slot.online || ctx.options.queue_if_offline {
            if slot.queue.len() >= ctx.options.max_queue_size {
                drop(slot);
                return Err(self.reject(command_id, GatewayError::QueueFull(device_id.to_string())));
            }
            slot.enqueue(ctx);
            TicketState::Queued
        } else {
            drop(slot);
            return Err(self.reject(command_id, GatewayError::DeviceOffline(device_id.to_string())));
        };

        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(device_id, command_id, ?state, "command accepted");
        Ok(CommandTicket {
            command_id: command_id.to_string(),
            device_id: device_id.to_string(),
            state,
            rx,
        })
    }

    fn reject(&self, command_id: &str, err: GatewayError) -> GatewayError {
        self.active.remove(command_id);
        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(command_id, code = err.code(), "command rejected");
        err
    }

    fn start(self: &Arc<Self>, slot: &mut DeviceSlot, ctx: Arc<CommandContext>) {
        slot.executing.insert(ctx.command_id.clone(), ctx.clone());
        tokio::spawn(self.clone().execute(ctx));
    }

    /// Move queued commands into execution while the device has capacity.
    fn pump(self: &Arc<Self>, slot: &mut DeviceSlot) {
        while slot.online && slot.executing.len() < self.max_concurrent {
            let Some(next) = slot.queue.pop_front() else {
                break;
            };
            self.start(slot, next);
        }
    }

    async fn execute(self: Arc<Self>, ctx: Arc<CommandContext>) {
        let result = self.attempts(&ctx).await;
        if let Some(slot) = self.devices.get(&ctx.device_id).map(|s| s.clone()) {
            let mut slot = slot.lock();
            slot.executing.remove(&ctx.command_id);
            self.pump(&mut slot);
        }
        if let Some(result) = result {
            self.settle(&ctx, result);
        }
    }

    /// Attempt loop. `None` means the command was cancelled and has already
    /// been settled by whoever cancelled it.
    async fn attempts(&self, ctx: &CommandContext) -> Option<CommandResult> {
        let policy = &ctx.options.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            ctx.attempts.store(attempt, Ordering::Relaxed);
            let call = self
                .transport
                .execute(&ctx.device_id, &ctx.command_id, ctx.command.clone());
            let outcome = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => return None,
                res = tokio::time::timeout(ctx.options.timeout, call) => {
                    res.unwrap_or(Err(GatewayError::CommandTimeout(ctx.options.timeout)))
                }
            };

            match outcome {
                Ok(result) => {
                    return Some(Ok(CommandOutcome {
                        command_id: ctx.command_id.clone(),
                        device_id: ctx.device_id.clone(),
                        result,
                        attempts: attempt,
                        duration: ctx.created_at.elapsed(),
                    }));
                }
                Err(err) if policy.should_retry(attempt, &err) => {
                    let delay = policy.delay_after(attempt);
                    self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        device_id = %ctx.device_id,
                        command_id = %ctx.command_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "command attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = ctx.cancel.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }

    /// Deliver the terminal result. Only the first call per command has any effect.
    fn settle(&self, ctx: &CommandContext, result: CommandResult) -> bool {
        let Some(tx) = ctx.done.lock().take() else {
            return false;
        };
        self.active.remove(&ctx.command_id);

        match &result {
            Ok(outcome) => {
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                let _ = self.events.send(DeviceEvent::CommandCompleted {
                    device_id: ctx.device_id.clone(),
                    command_id: ctx.command_id.clone(),
                    attempts: outcome.attempts,
                });
            }
            Err(GatewayError::Cancelled | GatewayError::DeviceDisconnected(_)) => {
                self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    device_id = %ctx.device_id,
                    command_id = %ctx.command_id,
                    attempts = ctx.attempts.load(Ordering::Relaxed),
                    error = %err,
                    "command failed"
                );
                let _ = self.events.send(DeviceEvent::CommandFailed {
                    device_id: ctx.device_id.clone(),
                    command_id: ctx.command_id.clone(),
                    error: err.clone(),
                });
            }
        }

        // cancelled commands may be resubmitted; everything else is final
        if !matches!(
            result,
            Err(GatewayError::Cancelled | GatewayError::DeviceDisconnected(_))
        ) {
            self.completed
                .lock()
                .insert(ctx.command_id.clone(), result.clone());
        }
        let _ = tx.send(result);
        true
    }

    fn abort(&self, ctx: &CommandContext, err: GatewayError) {
        self.settle(ctx, Err(err));
        ctx.cancel.cancel();
    }

    // -----------------------------------------------------------------------
    // Device lifecycle
    // -----------------------------------------------------------------------

    pub fn device_online(self: &Arc<Self>, device_id: &str) {
        let slot = self.slot(device_id);
        let mut slot = slot.lock();
        if !slot.online {
            slot.online = true;
            tracing::info!(device_id, queued = slot.queue.len(), "device online");
            let _ = self.events.send(DeviceEvent::Online(device_id.to_string()));
        }
        self.pump(&mut slot);
    }

    /// Cancel executing commands with `DeviceDisconnected`; queued commands
    /// survive only if they were submitted with `queue_if_offline`.
    /// Returns how many commands were cancelled.
    pub fn device_offline(&self, device_id: &str) -> usize {
        let Some(slot) = self.devices.get(device_id).map(|s| s.clone()) else {
            return 0;
        };
        let mut slot = slot.lock();
        slot.online = false;
        let err = GatewayError::DeviceDisconnected(device_id.to_string());
        let mut cancelled = 0;
        for (_, ctx) in slot.executing.drain() {
            self.abort(&ctx, err.clone());
            cancelled += 1;
        }
        let (keep, discard): (VecDeque<_>, VecDeque<_>) = slot
            .queue
            .drain(..)
            .partition(|ctx| ctx.options.queue_if_offline);
        slot.queue = keep;
        for ctx in discard {
            self.abort(&ctx, err.clone());
            cancelled += 1;
        }
        tracing::info!(device_id, cancelled, retained = slot.queue.len(), "device offline");
        let _ = self.events.send(DeviceEvent::Offline(device_id.to_string()));
        cancelled
    }

    /// Forget a device for good, cancelling everything it had.
    pub fn remove_device(&self, device_id: &str) -> usize {
        let Some((_, slot)) = self.devices.remove(device_id) else {
            return 0;
        };
        let mut guard = slot.lock();
        let slot = &mut *guard;
        slot.online = false;
        let err = GatewayError::DeviceDisconnected(device_id.to_string());
        let contexts: Vec<_> = slot
            .executing
            .drain()
            .map(|(_, ctx)| ctx)
            .chain(slot.queue.drain(..))
            .collect();
        for ctx in &contexts {
            self.abort(ctx, err.clone());
        }
        tracing::info!(device_id, cancelled = contexts.len(), "device removed");
        let _ = self.events.send(DeviceEvent::Removed(device_id.to_string()));
        contexts.len()
    }

    /// Cancel one queued or executing command. The caller sees `Cancelled`.
    pub fn cancel_command(self: &Arc<Self>, command_id: &str) -> bool {
        let Some(device_id) = self.active.get(command_id).map(|d| d.clone()) else {
            return false;
        };
        let Some(slot) = self.devices.get(&device_id).map(|s| s.clone()) else {
            return false;
        };
        let mut slot = slot.lock();
        if let Some(ctx) = slot.take_queued(command_id) {
            self.abort(&ctx, GatewayError::Cancelled);
            return true;
        }
        if let Some(ctx) = slot.executing.remove(command_id) {
            self.abort(&ctx, GatewayError::Cancelled);
            self.pump(&mut slot);
            return true;
        }
        false
    }

    pub fn publish_telemetry(&self, device_id: &str, event: &str, data: Value) {
        let _ = self.events.send(DeviceEvent::Telemetry {
            device_id: device_id.to_string(),
            event: event.to_string(),
            data,
        });
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn command_state(&self, command_id: &str) -> Option<CommandState> {
        if let Some(device_id) = self.active.get(command_id).map(|d| d.clone())
            && let Some(slot) = self.devices.get(&device_id).map(|s| s.clone())
        {
            let slot = slot.lock();
            if slot.executing.contains_key(command_id) {
                return Some(CommandState::Executing);
            }
            if slot.queue.iter().any(|ctx| ctx.command_id == command_id) {
                return Some(CommandState::Queued);
            }
        }
        self.completed.lock().get(command_id).map(|res| match res {
            Ok(_) => CommandState::Completed,
            Err(_) => CommandState::Failed,
        })
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|slot| slot.lock().online)
    }

    pub fn device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        let slot = self.devices.get(device_id)?.clone();
        let slot = slot.lock();
        Some(DeviceStatus {
            device_id: device_id.to_string(),
            online: slot.online,
            executing: slot.executing.len(),
            queued: slot.queue.len(),
        })
    }

    pub fn list_devices(&self) -> Vec<DeviceStatus> {
        let ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        let mut devices: Vec<DeviceStatus> = ids
            .iter()
            .filter_map(|id| self.device_status(id))
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::reliability::BackoffKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Records every call, holds each attempt for `delay` and fails the
    /// first N attempts of scripted command ids.
    #[derive(Default)]
    struct ScriptedTransport {
        delay: Duration,
        calls: Mutex<Vec<(String, Instant)>>,
        failures: Mutex<HashMap<String, u32>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedTransport {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }

        fn fail_first(&self, command_id: &str, times: u32) {
            self.failures.lock().insert(command_id.to_string(), times);
        }

        fn calls_for(&self, command_id: &str) -> Vec<Instant> {
            self.calls
                .lock()
                .iter()
                .filter(|(id, _)| id == command_id)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    impl DeviceTransport for ScriptedTransport {
        fn execute<'a>(
            &'a self,
            _device_id: &'a str,
            command_id: &'a str,
            _command: Value,
        ) -> BoxFuture<'a, Result<Value, GatewayError>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .push((command_id.to_string(), Instant::now()));
                let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.running.fetch_sub(1, Ordering::SeqCst);

                let mut failures = self.failures.lock();
                if let Some(left) = failures.get_mut(command_id)
                    && *left > 0
                {
                    *left -= 1;
                    return Err(GatewayError::Transport("link reset".into()));
                }
                Ok(json!({"ack": command_id}))
            })
        }
    }

    fn dispatcher(
        transport: Arc<ScriptedTransport>,
        max_concurrent: usize,
    ) -> Arc<CommandDispatcher> {
        let config = DispatcherConfig {
            max_concurrent_per_device: max_concurrent,
            ..DispatcherConfig::default()
        };
        Arc::new(CommandDispatcher::new(transport, &config))
    }

    fn options() -> CommandOptions {
        CommandOptions {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: BackoffKind::Exponential,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                ..RetryPolicy::default()
            },
            max_queue_size: 10,
            priority: Priority::Normal,
            queue_if_offline: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_queues_and_pulls_next_forward() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(100));
        let d = dispatcher(transport.clone(), 1);
        d.device_online("dev");

        let t1 = d.submit("dev", "c1", json!({}), options()).unwrap();
        let t2 = d.submit("dev", "c2", json!({}), options()).unwrap();
        let t3 = d.submit("dev", "c3", json!({}), options()).unwrap();
        assert_eq!(t1.state, TicketState::Dispatched);
        assert_eq!(t2.state, TicketState::Queued);
        assert_eq!(t3.state, TicketState::Queued);
        assert_eq!(d.command_state("c2"), Some(CommandState::Queued));

        let first = t1.wait().await.unwrap();
        assert_eq!(first.attempts, 1);
        assert_eq!(d.command_state("c2"), Some(CommandState::Executing));
        assert_eq!(d.command_state("c3"), Some(CommandState::Queued));

        assert!(t2.wait().await.is_ok());
        assert!(t3.wait().await.is_ok());
        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
        assert_eq!(d.command_state("c3"), Some(CommandState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_ceiling() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(50));
        let d = dispatcher(transport.clone(), 2);
        d.device_online("dev");

        let tickets: Vec<_> = (0..7)
            .map(|i| d.submit("dev", &format!("c{i}"), json!({}), options()).unwrap())
            .collect();
        for ticket in tickets {
            assert!(ticket.wait().await.is_ok());
        }
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
        assert_eq!(d.metrics.completed.load(Ordering::Relaxed), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_commands_run_by_priority() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(10));
        let d = dispatcher(transport.clone(), 1);
        d.device_online("dev");

        let busy = d.submit("dev", "busy", json!({}), options()).unwrap();
        let low = d
            .submit("dev", "low", json!({}), CommandOptions { priority: Priority::Low, ..options() })
            .unwrap();
        let high = d
            .submit("dev", "high", json!({}), CommandOptions { priority: Priority::High, ..options() })
            .unwrap();
        let normal = d.submit("dev", "normal", json!({}), options()).unwrap();
        for t in [busy, low, high, normal] {
            t.wait().await.unwrap();
        }
        let order: Vec<String> = transport.calls.lock().iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(order, vec!["busy", "high", "normal", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_backoff_and_stop_at_max_attempts() {
        let transport = ScriptedTransport::with_delay(Duration::ZERO);
        transport.fail_first("flaky", 2);
        transport.fail_first("dead", 10);
        let d = dispatcher(transport.clone(), 4);
        d.device_online("dev");

        let flaky = d.submit("dev", "flaky", json!({}), options()).unwrap();
        let outcome = flaky.wait().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        let calls = transport.calls_for("flaky");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_millis(100));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(200));

        let dead = d.submit("dev", "dead", json!({}), options()).unwrap();
        assert_eq!(
            dead.wait().await,
            Err(GatewayError::Transport("link reset".into()))
        );
        assert_eq!(transport.calls_for("dead").len(), 3);
        assert_eq!(d.command_state("dead"), Some(CommandState::Failed));
        assert_eq!(d.metrics.retried.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_on_first_attempt() {
        let transport = ScriptedTransport::with_delay(Duration::ZERO);
        transport.fail_first("once", 1);
        let d = dispatcher(transport.clone(), 1);
        d.device_online("dev");

        let opts = CommandOptions {
            retry: options().retry.with_retryable(|e| matches!(e, GatewayError::CommandTimeout(_))),
            ..options()
        };
        let ticket = d.submit("dev", "once", json!({}), opts).unwrap();
        assert!(matches!(ticket.wait().await, Err(GatewayError::Transport(_))));
        assert_eq!(transport.calls_for("once").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_surfaces_command_timeout() {
        let transport = ScriptedTransport::with_delay(Duration::from_secs(60));
        let d = dispatcher(transport, 1);
        d.device_online("dev");

        let opts = CommandOptions {
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::none(),
            ..options()
        };
        let ticket = d.submit("dev", "slow", json!({}), opts).unwrap();
        assert_eq!(
            ticket.wait().await,
            Err(GatewayError::CommandTimeout(Duration::from_secs(1)))
        );
    }

    #[tokio::test]
    async fn full_queue_and_offline_devices_reject_immediately() {
        let transport = ScriptedTransport::with_delay(Duration::ZERO);
        let d = dispatcher(transport, 1);

        let small = CommandOptions {
            max_queue_size: 2,
            ..options()
        };
        assert_eq!(
            d.submit("dev", "q1", json!({}), small.clone()).unwrap().state,
            TicketState::Queued
        );
        assert!(d.submit("dev", "q2", json!({}), small.clone()).is_ok());
        assert_eq!(
            d.submit("dev", "q3", json!({}), small).err(),
            Some(GatewayError::QueueFull("dev".into()))
        );

        let no_queue = CommandOptions {
            queue_if_offline: false,
            ..options()
        };
        assert_eq!(
            d.submit("other", "x", json!({}), no_queue).err(),
            Some(GatewayError::DeviceOffline("other".into()))
        );
        assert_eq!(d.metrics.rejected.load(Ordering::Relaxed), 2);
        // rejected ids are free for reuse
        assert!(d.submit("dev2", "q3", json!({}), options()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_ids_are_not_executed_twice() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(10));
        let d = dispatcher(transport.clone(), 1);
        d.device_online("dev");

        let first = d.submit("dev", "once", json!({}), options()).unwrap();
        assert_eq!(
            d.submit("dev", "once", json!({}), options()).err(),
            Some(GatewayError::DuplicateCommand("once".into()))
        );
        let original = first.wait().await.unwrap();

        let again = d.submit("dev", "once", json!({}), options()).unwrap();
        assert_eq!(again.state, TicketState::Cached);
        assert_eq!(again.wait().await.unwrap(), original);
        assert_eq!(transport.calls_for("once").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_cancels_executing_and_unqueueable_commands() {
        let transport = ScriptedTransport::with_delay(Duration::from_secs(5));
        let d = dispatcher(transport.clone(), 1);
        d.device_online("dev");
        let mut events = d.subscribe();

        let running = d.submit("dev", "run", json!({}), options()).unwrap();
        let kept = d.submit("dev", "kept", json!({}), options()).unwrap();
        let dropped = d
            .submit("dev", "dropped", json!({}), CommandOptions { queue_if_offline: false, ..options() })
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(d.device_offline("dev"), 2);
        let disconnected = Err(GatewayError::DeviceDisconnected("dev".into()));
        assert_eq!(running.wait().await, disconnected);
        assert_eq!(dropped.wait().await, disconnected);
        assert_eq!(d.command_state("kept"), Some(CommandState::Queued));
        assert_eq!(events.recv().await.unwrap(), DeviceEvent::Offline("dev".into()));

        d.device_online("dev");
        assert!(kept.wait().await.is_ok());
        assert_eq!(d.metrics.cancelled.load(Ordering::Relaxed), 2);
        // the aborted attempt never reached a second call
        assert_eq!(transport.calls_for("run").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_cancels_everything() {
        let transport = ScriptedTransport::with_delay(Duration::from_secs(5));
        let d = dispatcher(transport, 1);
        d.device_online("dev");
        let a = d.submit("dev", "a", json!({}), options()).unwrap();
        let b = d.submit("dev", "b", json!({}), options()).unwrap();

        assert_eq!(d.remove_device("dev"), 2);
        assert!(a.wait().await.is_err());
        assert!(b.wait().await.is_err());
        assert!(d.device_status("dev").is_none());
        assert!(!d.is_online("dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel_settles_once_and_frees_capacity() {
        let transport = ScriptedTransport::with_delay(Duration::from_secs(5));
        let d = dispatcher(transport, 1);
        d.device_online("dev");
        let a = d.submit("dev", "a", json!({}), options()).unwrap();
        let b = d.submit("dev", "b", json!({}), options()).unwrap();

        assert!(d.cancel_command("a"));
        assert!(!d.cancel_command("a"));
        assert_eq!(a.wait().await, Err(GatewayError::Cancelled));
        assert_eq!(d.command_state("b"), Some(CommandState::Executing));
        assert!(b.wait().await.is_ok());
    }
}
