//! System-wide Trading Halt
//!
//! Latched by safety-critical conditions (cap enforcement that cannot
//! converge). While latched, no account opens new positions. Only an operator
//! clears it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{error, warn};

/// Halt reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    /// Position cap still exceeded after the configured liquidation cycles
    CapNotConverged {
        account_id: String,
        open_positions: usize,
        max_positions: usize,
        cycles: u32,
    },
    /// Manual trigger by operator
    Manual(String),
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::CapNotConverged {
                account_id,
                open_positions,
                max_positions,
                cycles,
            } => write!(
                f,
                "account {} still holds {} positions (cap {}) after {} cycles",
                account_id, open_positions, max_positions, cycles
            ),
            HaltReason::Manual(reason) => write!(f, "manual: {}", reason),
        }
    }
}

/// Halt record kept while latched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltRecord {
    pub reason: HaltReason,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TradingHalt {
    halted: AtomicBool,
    record: RwLock<Option<HaltRecord>>,
}

impl TradingHalt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if trading is halted (fast atomic check)
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Latch the halt. The first reason is kept until cleared.
    pub fn trip(&self, reason: HaltReason) {
        let mut record = self.record.write().unwrap_or_else(|p| p.into_inner());
        if record.is_none() {
            error!(
                "🚨 TRADING HALTED system-wide: {} - no new positions until an operator clears it",
                reason
            );
            *record = Some(HaltRecord {
                reason,
                triggered_at: Utc::now(),
            });
        } else {
            error!("TRADING HALTED (already latched), additional reason: {}", reason);
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Operator intervention: clear the halt
    pub fn clear(&self, operator: &str) -> Option<HaltRecord> {
        let mut record = self.record.write().unwrap_or_else(|p| p.into_inner());
        self.halted.store(false, Ordering::SeqCst);
        let previous = record.take();
        if let Some(ref prev) = previous {
            warn!("Trading halt cleared by {} (was: {})", operator, prev.reason);
        }
        previous
    }

    pub fn record(&self) -> Option<HaltRecord> {
        self.record
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_latches_first_reason() {
        let halt = TradingHalt::new();
        assert!(!halt.is_halted());

        halt.trip(HaltReason::Manual("first".into()));
        halt.trip(HaltReason::Manual("second".into()));
        assert!(halt.is_halted());
        assert_eq!(
            halt.record().unwrap().reason,
            HaltReason::Manual("first".into())
        );

        let cleared = halt.clear("ops").unwrap();
        assert_eq!(cleared.reason, HaltReason::Manual("first".into()));
        assert!(!halt.is_halted());
        assert!(halt.record().is_none());
    }
}
