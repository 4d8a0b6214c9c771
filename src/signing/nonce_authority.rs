//! Nonce Authority
//!
//! Process-wide issuer of strictly increasing authentication nonces. All
//! credential sets share one authority, so nonces never collide across
//! accounts even when they share an exchange.

use crate::error::{KestrelError, Result};
use crate::signing::nonce_store::NonceStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Authentication nonce. Only the authority can mint one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(u64);

impl Nonce {
    pub fn value(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_test(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// High-resolution clock reading the nonce sequence is anchored to
pub trait NonceClock: Send + Sync {
    /// Nanoseconds since the Unix epoch
    fn now_nanos(&self) -> u64;
}

/// Wall-clock nanoseconds
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl NonceClock for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Configuration for the nonce authority
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Startup window during which calls are rate-limited (seconds)
    pub warmup_secs: u64,
    /// Minimum spacing between nonces during warm-up (ms)
    pub warmup_min_spacing_ms: u64,
    /// Most nonces issued in any one second of warm-up; 0 disables the cap
    pub warmup_max_per_sec: u32,
    /// Persist a new ceiling at least every this many issued nonces
    pub persist_every: u64,
    /// How far above the issued nonce each persisted ceiling reaches
    pub persist_headroom: u64,
    /// File used to persist the ceiling (takes precedence over the database)
    pub store_path: Option<String>,
    /// PostgreSQL URL used to persist the ceiling
    pub database_url: Option<String>,
    /// Scope key for the persisted ceiling
    pub scope: String,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 10,
            warmup_min_spacing_ms: 50,
            warmup_max_per_sec: 20,
            persist_every: 1_000,
            persist_headroom: 1_000_000_000, // one second of clock nanos
            store_path: None,
            database_url: None,
            scope: "global".to_string(),
        }
    }
}

#[derive(Debug)]
struct NonceState {
    last_issued: u64,
    persisted_ceiling: u64,
    issued_since_persist: u64,
    issued_total: u64,
    last_issued_at: Option<Instant>,
    window_started: Option<Instant>,
    window_count: u32,
    warmup_finished: bool,
}

/// Nonce statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceStats {
    pub last_issued: u64,
    pub persisted_ceiling: u64,
    pub issued_total: u64,
    pub warmup_active: bool,
}

impl std::fmt::Display for NonceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Nonce: {} (ceiling {}, issued {}, warm-up {})",
            self.last_issued,
            self.persisted_ceiling,
            self.issued_total,
            if self.warmup_active { "on" } else { "off" }
        )
    }
}

/// Issues nonces that are strictly greater than every nonce issued before,
/// including before a restart.
///
/// # How it works
/// 1. On open, the last persisted ceiling is loaded; every nonce ever issued is
///    at or below it
/// 2. Each call takes `max(clock_now, last_issued + 1)`
/// 3. Before a nonce above the durable ceiling is returned, a new ceiling
///    (`nonce + headroom`) is written to the store; every `persist_every`
///    calls the ceiling is refreshed as well
/// 4. During warm-up, consecutive nonces are spaced by a minimum interval
///    and no more than `warmup_max_per_sec` are issued in any one second
///
/// # Example
/// ```rust,ignore
/// let authority = NonceAuthority::open(config, store, Arc::new(SystemClock)).await?;
/// let nonce = authority.next().await?;
/// ```
pub struct NonceAuthority {
    config: NonceConfig,
    clock: Arc<dyn NonceClock>,
    store: Arc<dyn NonceStore>,
    state: Mutex<NonceState>,
    started_at: Instant,
}

impl NonceAuthority {
    /// Open the authority, restoring the persisted floor from `store`
    pub async fn open(
        config: NonceConfig,
        store: Arc<dyn NonceStore>,
        clock: Arc<dyn NonceClock>,
    ) -> Result<Self> {
        let floor = store.load_ceiling().await?.unwrap_or(0);
        let now = clock.now_nanos();

        info!(
            "Nonce authority opened: persisted floor {}, clock {} ({})",
            floor,
            now,
            store.describe()
        );

        Ok(Self {
            config,
            clock,
            store,
            state: Mutex::new(NonceState {
                last_issued: floor,
                persisted_ceiling: floor,
                issued_since_persist: 0,
                issued_total: 0,
                last_issued_at: None,
                window_started: None,
                window_count: 0,
                warmup_finished: false,
            }),
            started_at: Instant::now(),
        })
    }

    /// Issue the next nonce, honoring warm-up spacing
    pub async fn next(&self) -> Result<Nonce> {
        self.issue(true).await
    }

    /// Issue the next nonce without warm-up spacing.
    ///
    /// For callers that know they are not part of a startup burst.
    pub async fn next_unthrottled(&self) -> Result<Nonce> {
        self.issue(false).await
    }

    /// End the warm-up window early
    pub async fn finish_warmup(&self) {
        let mut state = self.state.lock().await;
        if !state.warmup_finished {
            state.warmup_finished = true;
            info!("Nonce warm-up finished early");
        }
    }

    pub async fn warmup_active(&self) -> bool {
        let state = self.state.lock().await;
        self.in_warmup(&state)
    }

    pub async fn stats(&self) -> NonceStats {
        let state = self.state.lock().await;
        NonceStats {
            last_issued: state.last_issued,
            persisted_ceiling: state.persisted_ceiling,
            issued_total: state.issued_total,
            warmup_active: self.in_warmup(&state),
        }
    }

    fn in_warmup(&self, state: &NonceState) -> bool {
        !state.warmup_finished
            && self.started_at.elapsed() < Duration::from_secs(self.config.warmup_secs)
    }

    /// Per-second cap during warm-up; waits for the next window when full
    async fn admit_in_window(&self, state: &mut NonceState) {
        let cap = self.config.warmup_max_per_sec;
        if cap == 0 {
            return;
        }

        let second = Duration::from_secs(1);
        let now = Instant::now();
        match state.window_started {
            Some(start) if now < start + second => {
                if state.window_count >= cap {
                    tokio::time::sleep_until(start + second).await;
                    state.window_started = Some(start + second);
                    state.window_count = 0;
                }
            }
            _ => {
                state.window_started = Some(now);
                state.window_count = 0;
            }
        }
        state.window_count += 1;
    }

    async fn issue(&self, throttle: bool) -> Result<Nonce> {
        // The lock is held across the spacing sleep and the store write so
        // issuance stays strictly ordered.
        let mut state = self.state.lock().await;

        if throttle && self.in_warmup(&state) {
            if let Some(last_at) = state.last_issued_at {
                let earliest = last_at + Duration::from_millis(self.config.warmup_min_spacing_ms);
                if Instant::now() < earliest {
                    tokio::time::sleep_until(earliest).await;
                }
            }
            self.admit_in_window(&mut state).await;
        }

        let now = self.clock.now_nanos();
        let candidate = if now > state.last_issued {
            now
        } else {
            state.last_issued.checked_add(1).ok_or_else(|| {
                KestrelError::Internal("nonce space exhausted".to_string())
            })?
        };

        let refresh_due = state.issued_since_persist + 1 >= self.config.persist_every.max(1);
        if candidate > state.persisted_ceiling || refresh_due {
            let ceiling = candidate
                .saturating_add(self.config.persist_headroom)
                .max(state.persisted_ceiling);
            // Nothing is issued unless the covering ceiling is durable.
            self.store.store_ceiling(ceiling).await.map_err(|e| match e {
                e @ KestrelError::NonceStore(_) => e,
                other => KestrelError::NonceStore(format!(
                    "persisting ceiling {} to {}: {}",
                    ceiling,
                    self.store.describe(),
                    other
                )),
            })?;
            debug!("Persisted nonce ceiling {}", ceiling);
            state.persisted_ceiling = ceiling;
            state.issued_since_persist = 0;
        } else {
            state.issued_since_persist += 1;
        }

        state.last_issued = candidate;
        state.issued_total += 1;
        state.last_issued_at = Some(Instant::now());

        Ok(Nonce(candidate))
    }
}
