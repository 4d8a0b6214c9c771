pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod signing;
pub mod strategy;

pub use config::{AccountConfig, AppConfig};
pub use coordination::{
    CircuitBreakerConfig, CircuitState, ExchangeCircuitBreaker, ExchangeHealth, HaltReason,
    ShutdownSignal, TradingHalt,
};
pub use coordinator::{AccountStatus, LoopState, Orchestrator, OrchestratorConfig};
pub use error::{ErrorClass, KestrelError, Result};
pub use exchange::{AccountGateway, ExchangeClient, ExchangeGuards, PaperExchange};
pub use signing::{CallSerializer, Nonce, NonceAuthority, NonceConfig};
pub use strategy::{
    CapConfig, CapOutcome, CapitalReservationManager, PositionReconciler, SignalSource,
};
