//! Account Execution Orchestrator
//!
//! Runs one independent loop per trading account. Loops share the exchange
//! guards (breaker, serializer) and the nonce authority, and nothing else:
//! a failing account pauses itself without touching its peers.

pub mod account_loop;
pub mod bootstrap;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod state;

pub use account_loop::AccountRuntime;
pub use bootstrap::{build_orchestrator, open_nonce_authority, ClientFactory};
pub use command::AccountCommand;
pub use config::OrchestratorConfig;
pub use coordinator::Orchestrator;
pub use state::{AccountStatus, CycleOutcome, LoopError, LoopState};
