//! Signal seam
//!
//! Deciding *what* to trade lives outside this crate. Each account loop asks
//! its `SignalSource` for trade intents once per cycle and runs them through
//! the reservation, cap and breaker gates.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{AccountId, AccountRole, OrderRequest, OrderSide};
use crate::error::Result;
use crate::strategy::reconciliation::PortfolioSnapshot;

/// A trade intent produced by signal evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Market order when `None`
    pub limit_price: Option<Decimal>,
    pub reason: String,
}

impl TradeSignal {
    pub fn buy(symbol: impl Into<String>, quantity: Decimal, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Buy,
            quantity,
            limit_price: None,
            reason: reason.into(),
        }
    }

    pub fn sell(symbol: impl Into<String>, quantity: Decimal, reason: impl Into<String>) -> Self {
        Self {
            side: OrderSide::Sell,
            ..Self::buy(symbol, quantity, reason)
        }
    }

    pub fn to_order_request(&self) -> OrderRequest {
        match self.limit_price {
            Some(price) => OrderRequest::limit(&self.symbol, self.side, self.quantity, price),
            None => OrderRequest::market(&self.symbol, self.side, self.quantity),
        }
    }

    /// Opening or growing a position needs capital; selling does not
    pub fn needs_capital(&self) -> bool {
        self.side == OrderSide::Buy
    }
}

/// What a signal source sees each cycle
#[derive(Debug, Clone)]
pub struct SignalContext {
    pub account_id: AccountId,
    pub role: AccountRole,
    pub cycle: u64,
    pub snapshot: PortfolioSnapshot,
    /// Symbols without an obtainable price; signals on them are dropped
    pub blocked_symbols: Vec<String>,
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, ctx: &SignalContext) -> Result<Vec<TradeSignal>>;
}

/// Never trades. The default for `kestrel run` without a strategy attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleSignalSource;

#[async_trait]
impl SignalSource for IdleSignalSource {
    fn name(&self) -> &str {
        "idle"
    }

    async fn evaluate(&self, _ctx: &SignalContext) -> Result<Vec<TradeSignal>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderType;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signal_to_order_request() {
        let market = TradeSignal::buy("BTC", dec!(0.5), "breakout").to_order_request();
        assert_eq!(market.order_type, OrderType::Market);
        assert_eq!(market.side, OrderSide::Buy);

        let limit = TradeSignal {
            limit_price: Some(dec!(99)),
            ..TradeSignal::sell("BTC", dec!(0.5), "take profit")
        }
        .to_order_request();
        assert_eq!(limit.order_type, OrderType::Limit);
        assert_eq!(limit.limit_price, Some(dec!(99)));
        assert!(!TradeSignal::sell("BTC", dec!(1), "exit").needs_capital());
    }
}
