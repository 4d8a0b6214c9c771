//! Coordination Layer
//!
//! Shared safety infrastructure for the account loops:
//! - Circuit breaker per exchange connection
//! - System-wide trading halt
//! - Cooperative stop signalling

pub mod circuit_breaker;
pub mod halt;
pub mod shutdown;

pub use circuit_breaker::{
    CallPermit, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, ExchangeCircuitBreaker,
    ExchangeHealth, TripReason,
};
pub use halt::{HaltReason, HaltRecord, TradingHalt};
pub use shutdown::{ShutdownSignal, StopToken};
