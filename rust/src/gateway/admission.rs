use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::compression::PayloadCodec;
use super::rate_limiter::{FixedWindow, SlidingWindow};
use super::registry::{Connection, OutboundFrame};
use crate::config::GatewayConfig;
use crate::error::{AdmissionReason, GatewayError};
use crate::jwt::{self, JwtConfig};

/// What the transport knows about a connection attempt after the handshake.
pub struct ConnectionRequest {
    pub token: Option<String>,
    pub source: IpAddr,
    /// Client asked for compressed payloads (`compression=1` on connect).
    pub compression: bool,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
}

#[derive(Default)]
pub struct AdmissionMetrics {
    pub admitted: AtomicU64,
    pub rejected_auth: AtomicU64,
    pub rejected_flood: AtomicU64,
    pub rejected_capacity: AtomicU64,
    pub rate_limited: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub max_connections: usize,
    pub burst_threshold: u32,
    pub burst_window: Duration,
    pub rate_max_requests: u32,
    pub rate_window: Duration,
    pub codec: PayloadCodec,
}

impl AdmissionSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            burst_threshold: config.ddos_protection.max_connections,
            burst_window: config.ddos_protection.window(),
            rate_max_requests: config.rate_limit.max_requests,
            rate_window: config.rate_limit.window(),
            codec: PayloadCodec::new(
                config.compression.threshold_bytes,
                config.compression.level,
            ),
        }
    }
}

/// Gates new connections and inbound messages.
///
/// One controller is shared by every worker so the connection ceiling and the
/// per-source flood protection are global to the process.
pub struct AdmissionController {
    jwt: JwtConfig,
    settings: AdmissionSettings,
    active: AtomicUsize,
    bursts: DashMap<IpAddr, SlidingWindow>,
    /// Blacklisted source -> end of its ban.
    blacklist: DashMap<IpAddr, Instant>,
    pub metrics: AdmissionMetrics,
}

impl AdmissionController {
    pub fn new(jwt: JwtConfig, settings: AdmissionSettings) -> Self {
        Self {
            jwt,
            settings,
            active: AtomicUsize::new(0),
            bursts: DashMap::new(),
            blacklist: DashMap::new(),
            metrics: AdmissionMetrics::default(),
        }
    }

    /// Decide on a connection attempt.
    ///
    /// Order: credential, blacklist, burst window, global ceiling. On success
    /// a capacity slot is held until `release` is called.
    pub fn admit(&self, req: ConnectionRequest) -> Result<Connection, GatewayError> {
        let claims = match req.token.as_deref() {
            Some(token) => jwt::decode_claims(token, &self.jwt),
            None => {
                self.metrics.rejected_auth.fetch_add(1, Ordering::Relaxed);
                return Err(GatewayError::Auth("missing bearer token".into()));
            }
        }
        .inspect_err(|_| {
            self.metrics.rejected_auth.fetch_add(1, Ordering::Relaxed);
        })?;

        let now = Instant::now();
        if self.is_blacklisted(req.source, now) {
            self.metrics.rejected_flood.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::Admission(AdmissionReason::Flood));
        }

        let recent = self
            .bursts
            .entry(req.source)
            .or_insert_with(|| SlidingWindow::new(self.settings.burst_window))
            .record();
        if recent > self.settings.burst_threshold as usize {
            self.blacklist
                .insert(req.source, now + self.settings.burst_window);
            self.metrics.rejected_flood.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                source = %req.source,
                recent,
                ban_ms = self.settings.burst_window.as_millis() as u64,
                "connection flood, source blacklisted"
            );
            return Err(GatewayError::Admission(AdmissionReason::Flood));
        }

        let max = self.settings.max_connections;
        if self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            self.metrics
                .rejected_capacity
                .fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::Admission(AdmissionReason::Capacity));
        }

        self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
        let codec = req.compression.then_some(self.settings.codec);
        Ok(Connection::new(
            Uuid::now_v7().to_string(),
            claims,
            req.source,
            FixedWindow::new(self.settings.rate_max_requests, self.settings.rate_window),
            codec,
            req.outbound,
        ))
    }

    fn is_blacklisted(&self, source: IpAddr, now: Instant) -> bool {
        let banned_until = self.blacklist.get(&source).map(|until| *until);
        match banned_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.blacklist.remove(&source);
                false
            }
            None => false,
        }
    }

    /// Free the capacity slot taken by a successful `admit`.
    pub fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Per-message admission. False means the message must be dropped and the
    /// client told `RATE_LIMIT_EXCEEDED`.
    pub fn check_rate(&self, conn: &Connection) -> bool {
        let ok = conn.check_rate();
        if !ok {
            self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn blacklisted_sources(&self) -> usize {
        self.blacklist.len()
    }

    /// Drop expired bans and idle burst windows.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.blacklist.retain(|_, until| now < *until);
        self.bursts.retain(|_, window| !window.is_idle());
    }
}
