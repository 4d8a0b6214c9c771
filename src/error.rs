use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the execution layer
#[derive(Error, Debug)]
pub enum KestrelError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Exchange transport errors (transient)
    #[error("Exchange timeout after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Exchange unavailable ({status}): {message}")]
    ExchangeUnavailable { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    // Exchange errors that retrying cannot fix (permanent)
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Nonce rejected by exchange: sent {sent}, last accepted {last_accepted}")]
    NonceRejected { sent: u64, last_accepted: u64 },

    // Market data errors
    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    // Circuit breaker
    #[error("Circuit open for {exchange}: retry in {retry_in_ms}ms")]
    CircuitOpen { exchange: String, retry_in_ms: u64 },

    #[error("Circuit half-open for {exchange}: trial call already in flight")]
    TrialInFlight { exchange: String },

    // Local state disagrees with the exchange
    #[error("State mismatch: {0}")]
    Consistency(String),

    // Safety-critical conditions
    #[error("Trading halted: {0}")]
    TradingHalted(String),

    #[error("Position cap: {0}")]
    Cap(#[from] CapError),

    #[error("Reservation: {0}")]
    Reservation(#[from] ReservationError),

    // Nonce persistence
    #[error("Nonce store error: {0}")]
    NonceStore(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for KestrelError
pub type Result<T> = std::result::Result<T, KestrelError>;

/// How a failure should be treated by the breaker and the account loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry through the circuit breaker; never fatal
    Transient,
    /// Surface immediately; retrying cannot help
    Permanent,
    /// Exchange state disagrees with local state; re-derive from the exchange
    Consistency,
    /// Escalate to a system-wide halt
    SafetyCritical,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Consistency => write!(f, "consistency"),
            ErrorClass::SafetyCritical => write!(f, "safety-critical"),
        }
    }
}

impl KestrelError {
    /// Classify this error per the failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            KestrelError::Timeout { .. }
            | KestrelError::RateLimited(_)
            | KestrelError::ExchangeUnavailable { .. }
            | KestrelError::Transport(_)
            | KestrelError::CircuitOpen { .. }
            | KestrelError::TrialInFlight { .. }
            | KestrelError::Database(_)
            | KestrelError::Io(_) => ErrorClass::Transient,

            KestrelError::Consistency(_) | KestrelError::NonceRejected { .. } => {
                ErrorClass::Consistency
            }

            // An unpriceable symbol blocks trading on it; it says nothing about
            // the exchange connection
            KestrelError::TradingHalted(_)
            | KestrelError::PriceUnavailable { .. }
            | KestrelError::Cap(_) => ErrorClass::SafetyCritical,

            KestrelError::Config(_)
            | KestrelError::Auth(_)
            | KestrelError::InvalidRequest(_)
            | KestrelError::OrderRejected(_)
            | KestrelError::Reservation(_)
            | KestrelError::NonceStore(_)
            | KestrelError::Validation(_)
            | KestrelError::Json(_)
            | KestrelError::Internal(_)
            | KestrelError::Cancelled
            | KestrelError::Other(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }

    /// Errors raised by the breaker itself rather than by the exchange
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(
            self,
            KestrelError::CircuitOpen { .. } | KestrelError::TrialInFlight { .. }
        )
    }

    /// The request may or may not have reached the exchange
    pub fn is_ambiguous_outcome(&self) -> bool {
        matches!(
            self,
            KestrelError::Timeout { .. }
                | KestrelError::Transport(_)
                | KestrelError::ExchangeUnavailable { .. }
        )
    }

    /// Build from an HTTP status code and message the way connectors report them
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => KestrelError::Auth(message),
            429 => KestrelError::RateLimited(message),
            400..=499 => KestrelError::InvalidRequest(message),
            _ => KestrelError::ExchangeUnavailable { status, message },
        }
    }
}

/// Errors from the capital reservation ledger
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReservationError {
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Reservation not found: {0}")]
    NotFound(String),

    #[error("Reservation already exists: {0}")]
    Duplicate(String),

    #[error("Reservation amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("Reservation {position_id} has unresolved order fate; resolve before release")]
    FateUnresolved { position_id: String },

    #[error("Insufficient capital: requested {requested}, available {available}")]
    Insufficient {
        requested: Decimal,
        available: Decimal,
    },
}

/// Errors from position cap enforcement
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapError {
    #[error("Cap not reached after {cycles} cycles: {open_positions} open, cap {max_positions}")]
    Halted {
        cycles: u32,
        open_positions: usize,
        max_positions: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(KestrelError::from_status(401, "bad key").class(), ErrorClass::Permanent);
        assert_eq!(KestrelError::from_status(429, "slow down").class(), ErrorClass::Transient);
        assert_eq!(KestrelError::from_status(400, "bad qty").class(), ErrorClass::Permanent);
        assert_eq!(KestrelError::from_status(503, "maintenance").class(), ErrorClass::Transient);
    }

    #[test]
    fn timeouts_are_transient() {
        let err = KestrelError::Timeout {
            operation: "place_order".to_string(),
            elapsed_ms: 5000,
        };
        assert!(err.is_transient());
        assert!(!err.is_breaker_rejection());
    }

    #[test]
    fn cap_halt_is_safety_critical() {
        let err: KestrelError = CapError::Halted {
            cycles: 3,
            open_positions: 10,
            max_positions: 8,
        }
        .into();
        assert_eq!(err.class(), ErrorClass::SafetyCritical);
        assert!(err.to_string().contains("10 open"));
    }
}
