//! Orchestrator Configuration

use serde::{Deserialize, Serialize};

/// Configuration shared by every account loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fixed delay between cycles (ms)
    pub cycle_interval_ms: u64,
    /// Run the position cap check every N cycles (1 = every cycle)
    pub cap_check_every_cycles: u64,
    /// Reconcile the local position book against the exchange every N cycles
    pub reconcile_every_cycles: u64,
    /// How long a submission with unknown outcome may stay unresolved before
    /// it is treated as never placed, provided no order or fill shows up (ms)
    pub unknown_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 5_000,
            cap_check_every_cycles: 6,
            reconcile_every_cycles: 12,
            unknown_grace_ms: 30_000,
        }
    }
}
