//! Operator commands delivered to a single account loop

/// Sent through the orchestrator to one account loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountCommand {
    /// Leave `Paused` and continue with the next cycle
    Resume,
    /// Stop trading until resumed
    Pause(String),
}
