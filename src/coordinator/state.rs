//! Account loop state visible to operators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AccountId, AccountRole};
use crate::error::{ErrorClass, KestrelError};

/// Where an account loop is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Scanning,
    Deciding,
    Reserving,
    Submitting,
    Settling,
    /// Permanent error; waiting for an operator `resume`
    Paused,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Scanning => "scanning",
            LoopState::Deciding => "deciding",
            LoopState::Reserving => "reserving",
            LoopState::Submitting => "submitting",
            LoopState::Settling => "settling",
            LoopState::Paused => "paused",
            LoopState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Last error surfaced by an account loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopError {
    pub message: String,
    pub class: ErrorClass,
    pub at: DateTime<Utc>,
}

impl LoopError {
    pub fn from_error(e: &KestrelError) -> Self {
        Self {
            message: e.to_string(),
            class: e.class(),
            at: Utc::now(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.class == ErrorClass::Permanent
    }
}

/// Read-only per-account status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account_id: AccountId,
    pub role: AccountRole,
    pub exchange: String,
    pub state: LoopState,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<LoopError>,
    pub last_skip_reason: Option<String>,
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub orders_submitted: u64,
}

impl AccountStatus {
    pub fn new(account_id: AccountId, role: AccountRole, exchange: impl Into<String>) -> Self {
        Self {
            account_id,
            role,
            exchange: exchange.into(),
            state: LoopState::Idle,
            last_cycle_at: None,
            last_error: None,
            last_skip_reason: None,
            cycles_completed: 0,
            cycles_skipped: 0,
            orders_submitted: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state, LoopState::Paused | LoopState::Stopped)
    }
}

/// How one cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { orders: u64 },
    Skipped(String),
}
