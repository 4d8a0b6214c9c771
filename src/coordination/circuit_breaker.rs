//! Exchange Circuit Breaker
//!
//! Wraps outbound exchange calls with failure counting, exponential backoff
//! with jitter and a three-state machine, so a degraded exchange is left alone
//! for a cooldown instead of being hammered by every account loop.

use crate::error::{KestrelError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,
    /// Failure threshold exceeded - calls rejected without being attempted
    Open,
    /// Recovery probing - one trial call at a time
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Health derived from the circuit state, consumed by the account loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeHealth {
    Healthy,
    Degraded,
    Offline,
}

impl std::fmt::Display for ExchangeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeHealth::Healthy => write!(f, "healthy"),
            ExchangeHealth::Degraded => write!(f, "degraded"),
            ExchangeHealth::Offline => write!(f, "offline"),
        }
    }
}

/// Configuration for the exchange circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive transient failures to trip the circuit
    pub failure_threshold: u32,
    /// Minimum time Open before a trial call is allowed (ms)
    pub recovery_timeout_ms: u64,
    /// Number of successful trial calls in HalfOpen to close the circuit
    pub half_open_success_threshold: u32,
    /// Backoff base (ms); backoff = base * 2^failures + jitter
    pub base_backoff_ms: u64,
    /// Backoff cap (ms)
    pub max_backoff_ms: u64,
    /// Upper bound of the random jitter added to each backoff (ms)
    pub jitter_ms: u64,
    /// Bounded timeout applied to every outbound call (ms)
    pub call_timeout_ms: u64,
    /// Let position queries and exits through while Open
    pub allow_exit_when_open: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_success_threshold: 2,
            base_backoff_ms: 250,
            max_backoff_ms: 60_000,
            jitter_ms: 250,
            call_timeout_ms: 10_000,
            allow_exit_when_open: false,
        }
    }
}

/// Trip reasons for the circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TripReason {
    ConsecutiveFailures(u32),
    HalfOpenTrialFailed(String),
    ManualTrip(String),
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveFailures(n) => write!(f, "{} consecutive failures", n),
            TripReason::HalfOpenTrialFailed(reason) => write!(f, "trial call failed: {}", reason),
            TripReason::ManualTrip(reason) => write!(f, "manual: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
    /// Bypassed an Open circuit via the exit path; does not drive transitions
    Lenient,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    trial_in_flight: bool,
    current_backoff: Duration,
    open_until: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_trip_reason: Option<TripReason>,
    total_trips: u64,
    total_rejected: u64,
}

/// Permission to make one outbound call.
///
/// Report the outcome with [`CallPermit::complete`]; a permit dropped without
/// completion (e.g. a cancelled task) frees the HalfOpen trial slot and records
/// nothing else.
pub struct CallPermit<'a> {
    breaker: &'a ExchangeCircuitBreaker,
    kind: PermitKind,
    completed: bool,
}

impl CallPermit<'_> {
    pub fn complete<T>(mut self, result: &Result<T>) {
        self.completed = true;
        self.breaker.record(self.kind, result.as_ref().err());
    }

    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.completed && self.kind == PermitKind::Trial {
            self.breaker.release_trial();
        }
    }
}

/// Circuit breaker for one exchange connection
pub struct ExchangeCircuitBreaker {
    exchange: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl ExchangeCircuitBreaker {
    pub fn new(exchange: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            exchange: exchange.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                trial_in_flight: false,
                current_backoff: Duration::ZERO,
                open_until: None,
                last_success: None,
                last_failure: None,
                last_trip_reason: None,
                total_trips: 0,
                total_rejected: 0,
            }),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(exchange: impl Into<String>) -> Self {
        Self::new(exchange, CircuitBreakerConfig::default())
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A panic while holding this lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, applying a due Open -> HalfOpen transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn health(&self) -> ExchangeHealth {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Open => ExchangeHealth::Offline,
            CircuitState::HalfOpen => ExchangeHealth::Degraded,
            CircuitState::Closed if inner.consecutive_failures > 0 => ExchangeHealth::Degraded,
            CircuitState::Closed => ExchangeHealth::Healthy,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(until) = inner.open_until {
                if Instant::now() >= until {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.trial_in_flight = false;
                    info!("{}: circuit breaker transitioning to HALF-OPEN", self.exchange);
                }
            }
        }
    }

    /// Ask to make a call.
    ///
    /// `lenient` marks existing-position queries and exits, which may pass an
    /// Open circuit when `allow_exit_when_open` is set.
    pub fn acquire(&self, lenient: bool) -> Result<CallPermit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        let bypass = lenient && self.config.allow_exit_when_open;
        let kind = match inner.state {
            CircuitState::Closed => PermitKind::Normal,
            CircuitState::Open => {
                if bypass {
                    PermitKind::Lenient
                } else {
                    inner.total_rejected += 1;
                    let retry_in_ms = inner
                        .open_until
                        .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
                        .unwrap_or(self.config.recovery_timeout_ms);
                    return Err(KestrelError::CircuitOpen {
                        exchange: self.exchange.clone(),
                        retry_in_ms,
                    });
                }
            }
            CircuitState::HalfOpen => {
                if !inner.trial_in_flight {
                    inner.trial_in_flight = true;
                    PermitKind::Trial
                } else if bypass {
                    PermitKind::Lenient
                } else {
                    inner.total_rejected += 1;
                    return Err(KestrelError::TrialInFlight {
                        exchange: self.exchange.clone(),
                    });
                }
            }
        };

        Ok(CallPermit {
            breaker: self,
            kind,
            completed: false,
        })
    }

    /// Run `f` through the breaker with the configured call timeout
    pub async fn call_guarded<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(false)?;
        let result = self.timed(operation, f()).await;
        permit.complete(&result);
        result
    }

    /// Like `call_guarded`, but through the exit path
    pub async fn call_lenient<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(true)?;
        let result = self.timed(operation, f()).await;
        permit.complete(&result);
        result
    }

    /// Retry transient failures, sleeping the breaker's current backoff
    /// between attempts. Breaker rejections and permanent errors return at once.
    pub async fn call_with_retry<F, Fut, T>(
        &self,
        operation: &str,
        max_attempts: u32,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match self.call_guarded(operation, &mut f).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !e.is_breaker_rejection() && attempt < max_attempts => {
                    let wait = self.current_backoff();
                    debug!(
                        "{}: {} attempt {}/{} failed ({}), retrying in {:?}",
                        self.exchange, operation, attempt, max_attempts, e, wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bound a call with the configured timeout; elapsing is a transient failure
    pub async fn timed<Fut, T>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let limit = Duration::from_millis(self.config.call_timeout_ms);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(KestrelError::Timeout {
                operation: operation.to_string(),
                elapsed_ms: self.config.call_timeout_ms,
            }),
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
    }

    fn record(&self, kind: PermitKind, error: Option<&KestrelError>) {
        let mut inner = self.lock();
        if kind == PermitKind::Trial {
            inner.trial_in_flight = false;
        }

        match error {
            None => self.on_success(&mut inner, kind),
            Some(e) if e.is_transient() && !e.is_breaker_rejection() => {
                self.on_failure(&mut inner, kind, &e.to_string())
            }
            // Permanent and consistency errors say nothing about exchange health
            Some(e) => debug!("{}: non-transient error not counted: {}", self.exchange, e),
        }
    }

    fn on_success(&self, inner: &mut BreakerInner, kind: PermitKind) {
        inner.last_success = Some(Utc::now());
        if kind == PermitKind::Lenient {
            return;
        }
        // Granted before the trip; only the HalfOpen trial may recover the circuit
        if kind == PermitKind::Normal && inner.state == CircuitState::Open {
            debug!("{}: late success ignored while open", self.exchange);
            return;
        }

        inner.consecutive_failures = 0;
        inner.current_backoff = Duration::ZERO;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_success_threshold.max(1) {
                self.close_locked(inner);
            }
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner, kind: PermitKind, reason: &str) {
        inner.last_failure = Some(Utc::now());
        if kind == PermitKind::Lenient {
            warn!("{}: exit-path call failed while open: {}", self.exchange, reason);
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.current_backoff = self.next_backoff(inner.consecutive_failures);

        warn!(
            "{}: call failure #{} ({}), backoff {:?}",
            self.exchange, inner.consecutive_failures, reason, inner.current_backoff
        );

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                self.trip_locked(inner, TripReason::HalfOpenTrialFailed(reason.to_string()))
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                let failures = inner.consecutive_failures;
                self.trip_locked(inner, TripReason::ConsecutiveFailures(failures))
            }
            _ => {}
        }
    }

    /// `min(base * 2^failures + jitter, cap)`
    fn next_backoff(&self, failures: u32) -> Duration {
        let exp = 2u64.saturating_pow(failures.min(32));
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        let millis = self
            .config
            .base_backoff_ms
            .saturating_mul(exp)
            .saturating_add(jitter)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(millis)
    }

    fn trip_locked(&self, inner: &mut BreakerInner, reason: TripReason) {
        let cooldown = Duration::from_millis(self.config.recovery_timeout_ms).max(inner.current_backoff);
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + cooldown);
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        inner.total_trips += 1;
        warn!(
            "{}: circuit breaker TRIPPED: {} (cooldown {:?})",
            self.exchange, reason, cooldown
        );
        inner.last_trip_reason = Some(reason);
    }

    fn close_locked(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        inner.current_backoff = Duration::ZERO;
        inner.open_until = None;
        info!("{}: circuit breaker CLOSED - normal operation resumed", self.exchange);
    }

    /// Manually trip the circuit
    pub fn trip(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            self.trip_locked(&mut inner, TripReason::ManualTrip(reason.to_string()));
        }
    }

    /// Force close the circuit (manual reset)
    pub fn force_close(&self) {
        let mut inner = self.lock();
        self.close_locked(&mut inner);
        inner.last_trip_reason = None;
        warn!("{}: circuit breaker force-closed", self.exchange);
    }

    pub fn current_backoff(&self) -> Duration {
        self.lock().current_backoff
    }

    /// Get circuit breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            exchange: self.exchange.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            current_backoff_ms: inner.current_backoff.as_millis() as u64,
            last_success: inner.last_success,
            last_failure: inner.last_failure,
            last_trip_reason: inner.last_trip_reason.clone(),
            total_trips: inner.total_trips,
            total_rejected: inner.total_rejected,
        }
    }
}

/// Statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub exchange: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub current_backoff_ms: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_trip_reason: Option<TripReason>,
    pub total_trips: u64,
    pub total_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 1_000,
            half_open_success_threshold: 2,
            base_backoff_ms: 10,
            max_backoff_ms: 500,
            jitter_ms: 0,
            call_timeout_ms: 200,
            allow_exit_when_open: false,
        }
    }

    fn transient() -> Result<()> {
        Err(KestrelError::from_status(503, "down"))
    }

    async fn fail(cb: &ExchangeCircuitBreaker) {
        let _ = cb.call_guarded("test", || async { transient() }).await;
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = ExchangeCircuitBreaker::with_defaults("paper");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health(), ExchangeHealth::Healthy);
    }

    #[tokio::test]
    async fn test_trip_on_failures_and_reject_without_calling() {
        let cb = ExchangeCircuitBreaker::new("paper", config());

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health(), ExchangeHealth::Degraded);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.health(), ExchangeHealth::Offline);

        let attempts = AtomicU32::new(0);
        let result = cb
            .call_guarded("test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(KestrelError::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().total_rejected, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = ExchangeCircuitBreaker::new("paper", config());

        fail(&cb).await;
        fail(&cb).await;
        cb.call_guarded("test", || async { Ok(()) }).await.unwrap();

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_count() {
        let cb = ExchangeCircuitBreaker::new("paper", config());

        for _ in 0..10 {
            let result: Result<()> = cb
                .call_guarded("test", || async { Err(KestrelError::Auth("bad key".into())) })
                .await;
            assert!(matches!(result, Err(KestrelError::Auth(_))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_late_success_does_not_reset_open_circuit() {
        let cb = ExchangeCircuitBreaker::new("paper", config());
        let straggler = cb.acquire(false).unwrap();
        for _ in 0..3 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        straggler.complete(&Ok(()));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().consecutive_failures, 3);
        assert!(cb.acquire(false).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_trial_in_half_open() {
        let cb = ExchangeCircuitBreaker::new("paper", config());
        for _ in 0..3 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cb.acquire(false).is_err());

        tokio::time::advance(Duration::from_millis(2)).await;
        let trial = cb.acquire(false).expect("trial call allowed");
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(
            cb.acquire(false),
            Err(KestrelError::TrialInFlight { .. })
        ));

        trial.complete::<()>(&Ok(()));
        // One success of two: still half-open, next trial allowed
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let trial = cb.acquire(false).unwrap();
        trial.complete::<()>(&Ok(()));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = ExchangeCircuitBreaker::new("paper", config());
        for _ in 0..3 {
            fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().total_trips, 2);
        assert!(matches!(
            cb.stats().last_trip_reason,
            Some(TripReason::HalfOpenTrialFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let cb = ExchangeCircuitBreaker::new("paper", config());
        cb.trip("test");
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let trial = cb.acquire(false).unwrap();
        drop(trial);
        assert!(cb.acquire(false).unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = ExchangeCircuitBreaker::new("paper", config());

        let result: Result<()> = cb
            .call_guarded("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(KestrelError::Timeout { .. })));
        assert_eq!(cb.stats().consecutive_failures, 1);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let cb = ExchangeCircuitBreaker::new("paper", config());
        assert_eq!(cb.next_backoff(1), Duration::from_millis(20));
        assert_eq!(cb.next_backoff(3), Duration::from_millis(80));
        assert_eq!(cb.next_backoff(30), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let cb = ExchangeCircuitBreaker::new(
            "paper",
            CircuitBreakerConfig {
                jitter_ms: 50,
                ..config()
            },
        );
        for _ in 0..100 {
            let backoff = cb.next_backoff(2);
            assert!(backoff >= Duration::from_millis(40));
            assert!(backoff <= Duration::from_millis(90));
        }
    }

    #[tokio::test]
    async fn test_lenient_path_when_configured() {
        let cb = ExchangeCircuitBreaker::new(
            "paper",
            CircuitBreakerConfig {
                allow_exit_when_open: true,
                ..config()
            },
        );
        cb.trip("test");

        assert!(cb.call_guarded("entry", || async { Ok(()) }).await.is_err());
        cb.call_lenient("exit", || async { Ok(()) }).await.unwrap();
        // Exit-path success does not close the circuit
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_lenient_path_blocked_by_default() {
        let cb = ExchangeCircuitBreaker::new("paper", config());
        cb.trip("test");
        assert!(cb.call_lenient("exit", || async { Ok(()) }).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let cb = ExchangeCircuitBreaker::new("paper", config());
        let attempts = AtomicU32::new(0);

        let value = cb
            .call_with_retry("flaky", 3, || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(KestrelError::RateLimited("429".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_trip_and_force_close() {
        let cb = ExchangeCircuitBreaker::with_defaults("paper");

        cb.trip("operator");
        assert_eq!(cb.state(), CircuitState::Open);

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.stats().last_trip_reason.is_none());
    }
}
