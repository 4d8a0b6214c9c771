use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{Balance, OpenOrder, OrderAck, OrderRequest};
use crate::error::Result;
use crate::signing::Nonce;

/// Capability supplied by an exchange connector.
///
/// Connectors own transport and request signing. Authenticated calls receive
/// their nonce from the caller and must use it as-is; errors should be mapped
/// with [`crate::error::KestrelError::from_status`] or the transport variants
/// so the transient/permanent classification is preserved.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_balances(&self, nonce: Nonce) -> Result<Vec<Balance>>;

    async fn fetch_open_orders(&self, nonce: Nonce) -> Result<Vec<OpenOrder>>;

    /// Public market data; unauthenticated
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal>;

    async fn place_order(&self, request: &OrderRequest, nonce: Nonce) -> Result<OrderAck>;

    async fn cancel_order(&self, order_id: &str, nonce: Nonce) -> Result<bool>;
}
