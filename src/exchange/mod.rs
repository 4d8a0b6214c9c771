//! Exchange access
//!
//! `ExchangeClient` is the connector seam; `AccountGateway` is the only way
//! the rest of the crate reaches it.

pub mod gateway;
pub mod paper;
mod traits;

pub use gateway::{AccountGateway, ExchangeGuards};
pub use paper::{PaperExchange, ScriptedFailure};
#[cfg(test)]
pub use traits::MockExchangeClient;
pub use traits::ExchangeClient;
