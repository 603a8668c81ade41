use std::time::Duration;

use crate::jwt::JwtError;

/// Why a new connection was refused before registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    /// Source exceeded the connection burst threshold or is blacklisted.
    Flood,
    /// Global connection ceiling reached.
    Capacity,
}

impl std::fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flood => write!(f, "too many connections from this source"),
            Self::Capacity => write!(f, "server at capacity"),
        }
    }
}

/// Error taxonomy shared by admission, queueing, dispatch and the cluster.
///
/// `Clone` so one terminal outcome can be handed to every party that asks
/// for it (the original caller and later duplicate submissions).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection refused: {0}")]
    Admission(AdmissionReason),
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("command queue full for device {0}")]
    QueueFull(String),
    #[error("device {0} is offline")]
    DeviceOffline(String),
    #[error("device {0} disconnected")]
    DeviceDisconnected(String),
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("command cancelled")]
    Cancelled,
    #[error("duplicate command id {0}")]
    DuplicateCommand(String),
    #[error("cluster coordination failed: {0}")]
    ClusterCoordination(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("connection channel closed")]
    ChannelClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Stable code carried in `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH_FAILED",
            Self::Admission(AdmissionReason::Flood) => "CONNECTION_FLOOD",
            Self::Admission(AdmissionReason::Capacity) => "SERVER_AT_CAPACITY",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::DeviceOffline(_) => "DEVICE_OFFLINE",
            Self::DeviceDisconnected(_) => "DEVICE_DISCONNECTED",
            Self::CommandTimeout(_) => "COMMAND_TIMEOUT",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Cancelled => "COMMAND_CANCELLED",
            Self::DuplicateCommand(_) => "DUPLICATE_COMMAND",
            Self::ClusterCoordination(_) => "CLUSTER_ERROR",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::ChannelClosed => "CONNECTION_CLOSED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Errors produced by a single device attempt. Only these feed the retry policy;
    /// everything else ends the command immediately.
    pub fn is_attempt_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::CommandTimeout(_))
    }
}

impl From<JwtError> for GatewayError {
    fn from(e: JwtError) -> Self {
        Self::Auth(e.to_string())
    }
}
