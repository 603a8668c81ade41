// Failure handling shared by the command dispatcher and the Redis bus:
// the command retry policy, the bus reconnect delay and a circuit breaker
// guarding bus publishes and reconnect attempts.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::config::RetryStrategyConfig;
use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Command retry policy
// ---------------------------------------------------------------------------

/// Delay growth between command attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Constant,
    Linear,
    #[default]
    Exponential,
}

impl BackoffKind {
    /// Delay after failed attempt `attempt` (1-based), clamped to `max`.
    ///
    /// constant: `initial`; linear: `attempt * initial`;
    /// exponential: `initial * 2^(attempt - 1)`.
    pub fn delay(self, attempt: u32, initial: Duration, max: Duration) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self {
            Self::Constant => initial,
            Self::Linear => initial.saturating_mul(attempt),
            Self::Exponential => 2u32
                .checked_pow(attempt - 1)
                .map(|factor| initial.saturating_mul(factor))
                .unwrap_or(max),
        };
        raw.min(max)
    }
}

pub type RetryPredicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Extra filter on attempt failures; defaults to retrying everything.
    pub retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryStrategyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryStrategyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            retryable: Arc::new(|_| true),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_retryable(
        mut self,
        predicate: impl Fn(&GatewayError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .delay(attempt, self.initial_delay, self.max_delay)
    }

    /// Whether another attempt follows failed attempt `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32, err: &GatewayError) -> bool {
        attempt < self.max_attempts && err.is_attempt_failure() && (self.retryable)(err)
    }
}

// ---------------------------------------------------------------------------
// Bus reconnect delay: exponential growth with +/-20% jitter
// ---------------------------------------------------------------------------

pub struct ReconnectDelay {
    initial: Duration,
    max: Duration,
    failures: u32,
    jitter: ahash::RandomState,
}

impl ReconnectDelay {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
            jitter: ahash::RandomState::new(),
        }
    }

    /// Delay before the next reconnect attempt; each call counts one failure.
    pub fn next(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let base = BackoffKind::Exponential.delay(self.failures, self.initial, self.max);
        // factor in [0.8, 1.2)
        let spread = (self.jitter.hash_one(self.failures) % 1_000) as f64 / 1_000.0;
        base.mul_f64(0.8 + 0.4 * spread).min(self.max)
    }

    /// The session came up; start over from `initial`.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker: Closed -> Open -> HalfOpen -> Closed
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before trial calls are let through.
    pub open_for: Duration,
    /// Trial calls allowed while half-open.
    pub trial_calls: u32,
    /// Trial successes needed to close again.
    pub close_after: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            open_for: Duration::from_secs(60),
            trial_calls: 3,
            close_after: 3,
        }
    }
}

#[derive(Debug)]
pub struct Breaker {
    settings: BreakerSettings,
    state: BreakerState,
    failures: u32,
    trials: u32,
    trial_successes: u32,
    opened_at: Option<Instant>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl Breaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: BreakerState::Closed,
            failures: 0,
            trials: 0,
            trial_successes: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn open_for(&self) -> Duration {
        self.settings.open_for
    }

    /// Whether a call may go ahead now. An open breaker turns half-open once
    /// `open_for` has passed; half-open admits `trial_calls` calls.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = self
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.settings.open_for);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    self.trials = 1;
                    self.trial_successes = 0;
                }
                cooled
            }
            BreakerState::HalfOpen if self.trials < self.settings.trial_calls => {
                self.trials += 1;
                true
            }
            BreakerState::HalfOpen => false,
        }
    }

    pub fn on_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.failures = 0,
            BreakerState::HalfOpen => {
                self.trial_successes += 1;
                if self.trial_successes >= self.settings.close_after {
                    self.state = BreakerState::Closed;
                    self.failures = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.settings.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::HalfOpen => self.trip(),
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.trials = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_breaker() -> Breaker {
        Breaker::new(BreakerSettings {
            failure_threshold: 3,
            open_for: Duration::from_secs(5),
            trial_calls: 2,
            close_after: 2,
        })
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut b = quick_breaker();
        b.on_failure();
        b.on_failure();
        b.on_success();
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_then_recovers_through_trials() {
        let mut b = quick_breaker();
        for _ in 0..3 {
            b.on_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.allow());
        assert!(!b.allow(), "only two trial calls while half-open");

        b.on_success();
        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let mut b = quick_breaker();
        for _ in 0..3 {
            b.on_failure();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(b.allow());
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn reconnect_delay_grows_with_jitter_and_resets() {
        let mut d = ReconnectDelay::new(Duration::from_millis(100), Duration::from_secs(2));
        let first = d.next();
        assert!(first >= Duration::from_millis(80) && first < Duration::from_millis(120));
        let second = d.next();
        assert!(second >= Duration::from_millis(160) && second < Duration::from_millis(240));
        for _ in 0..40 {
            assert!(d.next() <= Duration::from_secs(2));
        }
        d.reset();
        assert!(d.next() < Duration::from_millis(120));
    }

    #[test]
    fn backoff_formulas_clamp_to_max() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        let constant: Vec<u64> = (1..=4)
            .map(|k| BackoffKind::Constant.delay(k, initial, max).as_millis() as u64)
            .collect();
        assert_eq!(constant, vec![100, 100, 100, 100]);

        let linear: Vec<u64> = (1..=12)
            .map(|k| BackoffKind::Linear.delay(k, initial, max).as_millis() as u64)
            .collect();
        assert_eq!(&linear[..4], &[100, 200, 300, 400]);
        assert_eq!(linear[11], 1000);

        let exponential: Vec<u64> = (1..=6)
            .map(|k| BackoffKind::Exponential.delay(k, initial, max).as_millis() as u64)
            .collect();
        assert_eq!(exponential, vec![100, 200, 400, 800, 1000, 1000]);

        // huge attempt counts do not overflow
        assert_eq!(BackoffKind::Exponential.delay(200, initial, max), max);
    }

    #[test]
    fn retry_policy_respects_attempts_and_predicate() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let transport = GatewayError::Transport("io".into());
        assert!(policy.should_retry(1, &transport));
        assert!(policy.should_retry(2, &transport));
        assert!(!policy.should_retry(3, &transport));
        assert!(!policy.should_retry(1, &GatewayError::DeviceDisconnected("d".into())));

        let picky = policy.with_retryable(|e| matches!(e, GatewayError::CommandTimeout(_)));
        assert!(!picky.should_retry(1, &transport));
        assert!(picky.should_retry(1, &GatewayError::CommandTimeout(Duration::from_secs(1))));
        assert!(!RetryPolicy::none().should_retry(1, &transport));
    }
}
