// Device links: devices that connect as WebSocket clients with the `device`
// role. A command goes out as a `device_command` frame and completes when the
// device answers with a `command_result` carrying the same command id.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use super::dispatcher::DeviceTransport;
use super::message;
use super::registry::Connection;
use crate::error::GatewayError;

type Reply = Result<Value, GatewayError>;

struct PendingReply {
    device_id: String,
    /// Which attempt registered this entry.
    attempt: u64,
    tx: oneshot::Sender<Reply>,
}

/// Removes the pending entry when the awaiting attempt ends for any reason
/// (reply, timeout or cancellation). A later attempt that reused the command
/// id keeps its own entry.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingReply>,
    command_id: &'a str,
    attempt: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .remove_if(self.command_id, |_, p| p.attempt == self.attempt);
    }
}

#[derive(Default)]
pub struct LinkMetrics {
    pub commands_sent: AtomicU64,
    pub replies: AtomicU64,
    pub orphan_replies: AtomicU64,
}

#[derive(Default)]
pub struct DeviceLinks {
    links: DashMap<String, Arc<Connection>>,
    pending: DashMap<String, PendingReply>,
    attempts: AtomicU64,
    pub metrics: LinkMetrics,
}

impl DeviceLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` the link for `device_id`. A previous link for the same
    /// device is closed and returned.
    pub fn attach(&self, device_id: &str, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = self.links.insert(device_id.to_string(), conn);
        if let Some(old) = &previous {
            tracing::info!(device_id, conn_id = %old.id, "device link replaced");
            old.close();
        }
        previous
    }

    /// Drop the link only if `conn_id` is still the current one.
    pub fn detach(&self, device_id: &str, conn_id: &str) -> bool {
        self.links
            .remove_if(device_id, |_, conn| conn.id == conn_id)
            .is_some()
    }

    pub fn is_linked(&self, device_id: &str) -> bool {
        self.links.contains_key(device_id)
    }

    pub fn linked_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Complete an outstanding command with the device's reply. Returns false
    /// for replies nobody is waiting on (late, duplicate or unknown).
    pub fn resolve(&self, device_id: &str, command_id: &str, reply: Reply) -> bool {
        let Some((_, pending)) = self
            .pending
            .remove_if(command_id, |_, p| p.device_id == device_id)
        else {
            self.metrics.orphan_replies.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(device_id, command_id, "reply without a pending command");
            return false;
        };
        self.metrics.replies.fetch_add(1, Ordering::Relaxed);
        pending.tx.send(reply).is_ok()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl DeviceTransport for DeviceLinks {
    fn execute<'a>(
        &'a self,
        device_id: &'a str,
        command_id: &'a str,
        command: Value,
    ) -> BoxFuture<'a, Result<Value, GatewayError>> {
        Box::pin(async move {
            let link = self
                .links
                .get(device_id)
                .map(|c| c.clone())
                .ok_or_else(|| GatewayError::Transport(format!("no link for device {device_id}")))?;

            let (tx, rx) = oneshot::channel();
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
            self.pending.insert(
                command_id.to_string(),
                PendingReply {
                    device_id: device_id.to_string(),
                    attempt,
                    tx,
                },
            );
            let _guard = PendingGuard {
                pending: &self.pending,
                command_id,
                attempt,
            };

            link.send(&message::device_command(command_id, command))
                .map_err(|_| GatewayError::Transport(format!("link to {device_id} closed")))?;
            self.metrics.commands_sent.fetch_add(1, Ordering::Relaxed);

            rx.await
                .unwrap_or_else(|_| Err(GatewayError::Transport("reply channel dropped".into())))
        })
    }
}
