// Wire envelope shared by clients, devices and the gateway.
//
//   { "id", "type", "payload", "timestamp" (ms epoch), "priority"?, "compression"? }

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::GatewayError;

/// Wall-clock time in milliseconds since UNIX epoch.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message priority. Variant order is the delivery order, lowest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub const LEVELS: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
}

impl Envelope {
    /// Build a server-originated envelope with a fresh id and timestamp.
    pub fn new(msg_type: &str, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            msg_type: msg_type.to_string(),
            payload,
            timestamp: epoch_ms(),
            priority: None,
            compression: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Parse an inbound text frame. Missing ids and timestamps are filled in
    /// so every queued message is addressable.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let mut env: Envelope = serde_json::from_str(text)
            .map_err(|e| GatewayError::InvalidMessage(e.to_string()))?;
        if env.msg_type.is_empty() {
            return Err(GatewayError::InvalidMessage("missing type".into()));
        }
        if env.id.is_empty() {
            env.id = Uuid::now_v7().to_string();
        }
        if env.timestamp == 0 {
            env.timestamp = epoch_ms();
        }
        Ok(env)
    }

    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.unwrap_or(false)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// String field of the payload, if present and non-empty.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Server-originated messages
// ---------------------------------------------------------------------------

pub fn welcome(conn_id: &str, user_id: &str, session_id: &str, worker_id: usize) -> Envelope {
    Envelope::new(
        "welcome",
        json!({
            "connectionId": conn_id,
            "userId": user_id,
            "sessionId": session_id,
            "workerId": worker_id,
            "serverTime": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "features": {
                "compression": true,
                "priorityQueue": true,
                "rooms": true,
                "commandRetry": true,
            },
        }),
    )
}

pub fn pong(client_timestamp: i64) -> Envelope {
    let server_ts = epoch_ms();
    Envelope::new(
        "pong",
        json!({
            "clientTimestamp": client_timestamp,
            "serverTimestamp": server_ts,
            "latency": server_ts.saturating_sub(client_timestamp).max(0),
        }),
    )
}

pub fn error(err: &GatewayError, ref_id: Option<&str>) -> Envelope {
    error_code(err.code(), &err.to_string(), ref_id)
}

pub fn error_code(code: &str, message: &str, ref_id: Option<&str>) -> Envelope {
    Envelope::new(
        "error",
        json!({
            "code": code,
            "message": message,
            "refId": ref_id,
        }),
    )
    .with_priority(Priority::High)
}

pub fn command_success(
    command_id: &str,
    device_id: &str,
    result: Value,
    attempts: u32,
    duration_ms: u64,
) -> Envelope {
    Envelope::new(
        "command_success",
        json!({
            "commandId": command_id,
            "deviceId": device_id,
            "result": result,
            "attempts": attempts,
            "durationMs": duration_ms,
        }),
    )
}

pub fn command_queued(command_id: &str, device_id: &str) -> Envelope {
    Envelope::new(
        "command_queued",
        json!({"commandId": command_id, "deviceId": device_id}),
    )
}

pub fn device_event(device_id: &str, event: &str, data: Value) -> Envelope {
    Envelope::new(
        "device_event",
        json!({"deviceId": device_id, "event": event, "data": data}),
    )
}

pub fn device_status(device_id: &str, status: Value) -> Envelope {
    Envelope::new(
        "device_status",
        json!({"deviceId": device_id, "status": status}),
    )
}

pub fn device_list(devices: Value) -> Envelope {
    Envelope::new("device_list", json!({"devices": devices}))
}

pub fn subscription_success(device_id: &str) -> Envelope {
    Envelope::new("subscription_success", json!({"deviceId": device_id}))
}

pub fn unsubscription_success(device_id: &str) -> Envelope {
    Envelope::new("unsubscription_success", json!({"deviceId": device_id}))
}

pub fn room_joined(room: &str) -> Envelope {
    Envelope::new("room_joined", json!({"room": room}))
}

pub fn room_left(room: &str) -> Envelope {
    Envelope::new("room_left", json!({"room": room}))
}

/// Command frame pushed to a device link.
pub fn device_command(command_id: &str, command: Value) -> Envelope {
    Envelope::new(
        "device_command",
        json!({"commandId": command_id, "command": command}),
    )
    .with_priority(Priority::High)
}
