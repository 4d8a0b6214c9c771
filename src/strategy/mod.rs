//! Strategy-side safety components
//!
//! - `reconciliation` - exchange-truth position snapshots and cap enforcement
//! - `fund_manager` - per-account capital reservations
//! - `signal` - the seam to external signal evaluation

pub mod fund_manager;
pub mod reconciliation;
pub mod signal;

pub use fund_manager::{
    CapitalConfig, CapitalReservationManager, LedgerSnapshot, Reservation, ReservationStatus,
};
pub use reconciliation::{
    CapConfig, CapOutcome, CapReport, DiscrepancySeverity, PortfolioSnapshot, PositionBook,
    PositionDiscrepancy, PositionReconciler, ReconciliationResult,
};
pub use signal::{IdleSignalSource, SignalContext, SignalSource, TradeSignal};
