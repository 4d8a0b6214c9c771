//! Paper Exchange
//!
//! In-memory exchange used by the binary's `--paper` mode and by tests:
//! - Market orders fill instantly at the configured price
//! - Limit orders rest until cancelled
//! - Authenticated calls must carry strictly increasing nonces
//! - Failures can be scripted per call or for every call

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::domain::{Balance, OpenOrder, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType};
use crate::error::{KestrelError, Result};
use crate::exchange::ExchangeClient;
use crate::signing::Nonce;

/// A failure injected into the next call (or every call)
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedFailure {
    /// Stall for the duration, then drop the connection
    Hang(Duration),
    /// Apply the call, then stall before answering
    ApplyThenHang(Duration),
    RateLimited,
    ServerError,
    AuthFailure,
}

#[derive(Debug, Default)]
struct Book {
    balances: HashMap<String, Decimal>,
    prices: HashMap<String, Decimal>,
    open_orders: Vec<OpenOrder>,
    last_nonce: Option<u64>,
    next_order_id: u64,
    failures: VecDeque<ScriptedFailure>,
    order_failures: VecDeque<ScriptedFailure>,
    fail_all: Option<ScriptedFailure>,
    fills_frozen: bool,
    orders_placed: u64,
}

pub struct PaperExchange {
    name: String,
    quote_asset: String,
    latency: Option<Duration>,
    book: Mutex<Book>,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PaperExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quote_asset: "USD".to_string(),
            latency: None,
            book: Mutex::new(Book::default()),
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_quote_asset(mut self, asset: impl Into<String>) -> Self {
        self.quote_asset = asset.into();
        self
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_balance(self, asset: &str, quantity: Decimal) -> Self {
        self.set_balance(asset, quantity);
        self
    }

    pub fn with_price(self, symbol: &str, price: Decimal) -> Self {
        self.set_price(symbol, price);
        self
    }

    fn book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    pub fn set_balance(&self, asset: &str, quantity: Decimal) {
        let mut book = self.book();
        if quantity.is_zero() {
            book.balances.remove(asset);
        } else {
            book.balances.insert(asset.to_string(), quantity);
        }
    }

    pub fn balance(&self, asset: &str) -> Decimal {
        self.book().balances.get(asset).copied().unwrap_or_default()
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.book().prices.insert(symbol.to_string(), price);
    }

    /// Make `symbol` unpriceable
    pub fn remove_price(&self, symbol: &str) {
        self.book().prices.remove(symbol);
    }

    /// Queue a failure for the next call
    pub fn push_failure(&self, failure: ScriptedFailure) {
        self.book().failures.push_back(failure);
    }

    /// Queue a failure for the next `place_order` only
    pub fn push_order_failure(&self, failure: ScriptedFailure) {
        self.book().order_failures.push_back(failure);
    }

    /// Fail every call until cleared with `None`
    pub fn fail_all(&self, failure: Option<ScriptedFailure>) {
        self.book().fail_all = failure;
    }

    /// Accept market orders without filling them
    pub fn set_fills_frozen(&self, frozen: bool) {
        self.book().fills_frozen = frozen;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn orders_placed(&self) -> u64 {
        self.book().orders_placed
    }

    /// Highest number of calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_nonce(&self) -> Option<u64> {
        self.book().last_nonce
    }

    /// Count the call, apply latency and any scripted failure.
    ///
    /// Returns the stall to apply after the call when one was scripted.
    async fn enter(&self, order: bool) -> Result<Option<Duration>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failure = {
            let mut book = self.book();
            let targeted = if order { book.order_failures.pop_front() } else { None };
            targeted
                .or_else(|| book.failures.pop_front())
                .or_else(|| book.fail_all.clone())
        };

        match failure {
            None => Ok(None),
            Some(ScriptedFailure::ApplyThenHang(stall)) => Ok(Some(stall)),
            Some(ScriptedFailure::Hang(stall)) => {
                tokio::time::sleep(stall).await;
                Err(KestrelError::Transport(format!("{}: connection reset", self.name)))
            }
            Some(ScriptedFailure::RateLimited) => Err(KestrelError::from_status(429, "too many requests")),
            Some(ScriptedFailure::ServerError) => Err(KestrelError::from_status(503, "service unavailable")),
            Some(ScriptedFailure::AuthFailure) => Err(KestrelError::from_status(401, "invalid api key")),
        }
    }

    fn track(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    fn check_nonce(book: &mut Book, nonce: Nonce) -> Result<()> {
        if let Some(last) = book.last_nonce {
            if nonce.value() <= last {
                return Err(KestrelError::NonceRejected {
                    sent: nonce.value(),
                    last_accepted: last,
                });
            }
        }
        book.last_nonce = Some(nonce.value());
        Ok(())
    }

    async fn stall(after: Option<Duration>) {
        if let Some(stall) = after {
            tokio::time::sleep(stall).await;
        }
    }

    fn fill(&self, book: &mut Book, request: &OrderRequest) -> Result<(OrderStatus, Decimal, Option<Decimal>)> {
        let price = match request.order_type {
            OrderType::Limit => {
                return Ok((OrderStatus::Open, Decimal::ZERO, None));
            }
            OrderType::Market if book.fills_frozen => {
                return Ok((OrderStatus::Open, Decimal::ZERO, None));
            }
            OrderType::Market => book.prices.get(&request.symbol).copied().ok_or_else(|| {
                KestrelError::OrderRejected(format!("no market for {}", request.symbol))
            })?,
        };

        let notional = price * request.quantity;
        let held = book.balances.get(&request.symbol).copied().unwrap_or_default();
        let cash = book.balances.get(&self.quote_asset).copied().unwrap_or_default();

        let (new_held, new_cash) = match request.side {
            OrderSide::Buy => {
                if cash < notional {
                    return Err(KestrelError::OrderRejected(format!(
                        "insufficient {}: need {}, have {}",
                        self.quote_asset, notional, cash
                    )));
                }
                (held + request.quantity, cash - notional)
            }
            OrderSide::Sell => {
                if held < request.quantity {
                    return Err(KestrelError::OrderRejected(format!(
                        "insufficient {}: need {}, have {}",
                        request.symbol, request.quantity, held
                    )));
                }
                (held - request.quantity, cash + notional)
            }
        };

        for (asset, quantity) in [(request.symbol.clone(), new_held), (self.quote_asset.clone(), new_cash)] {
            if quantity.is_zero() {
                book.balances.remove(&asset);
            } else {
                book.balances.insert(asset, quantity);
            }
        }

        Ok((OrderStatus::Filled, request.quantity, Some(price)))
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn fetch_balances(&self, nonce: Nonce) -> Result<Vec<Balance>> {
        let _tracked = self.track();
        let stall = self.enter(false).await?;

        let balances = {
            let mut book = self.book();
            Self::check_nonce(&mut book, nonce)?;
            let mut balances: Vec<Balance> = book
                .balances
                .iter()
                .map(|(asset, qty)| Balance::new(asset.clone(), *qty))
                .collect();
            balances.sort_by(|a, b| a.asset.cmp(&b.asset));
            balances
        };

        Self::stall(stall).await;
        Ok(balances)
    }

    async fn fetch_open_orders(&self, nonce: Nonce) -> Result<Vec<OpenOrder>> {
        let _tracked = self.track();
        let stall = self.enter(false).await?;

        let orders = {
            let mut book = self.book();
            Self::check_nonce(&mut book, nonce)?;
            book.open_orders.clone()
        };

        Self::stall(stall).await;
        Ok(orders)
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Decimal> {
        let _tracked = self.track();
        let stall = self.enter(false).await?;

        let price = self.book().prices.get(symbol).copied();
        Self::stall(stall).await;

        price.ok_or_else(|| KestrelError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: format!("{} has no market", self.name),
        })
    }

    async fn place_order(&self, request: &OrderRequest, nonce: Nonce) -> Result<OrderAck> {
        let _tracked = self.track();
        let stall = self.enter(true).await?;

        if request.quantity <= Decimal::ZERO {
            return Err(KestrelError::InvalidRequest(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }

        let ack = {
            let mut book = self.book();
            Self::check_nonce(&mut book, nonce)?;
            let (status, filled, avg_price) = self.fill(&mut book, request)?;

            book.next_order_id += 1;
            book.orders_placed += 1;
            let order_id = format!("{}-{}", self.name, book.next_order_id);

            if status == OrderStatus::Open {
                book.open_orders.push(OpenOrder {
                    order_id: order_id.clone(),
                    client_order_id: request.client_order_id.clone(),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    quantity: request.quantity,
                    filled_quantity: Decimal::ZERO,
                    status,
                });
            }

            OrderAck {
                order_id,
                client_order_id: request.client_order_id.clone(),
                status,
                filled_quantity: filled,
                avg_fill_price: avg_price,
                nonce: nonce.value(),
                accepted_at: Utc::now(),
            }
        };

        debug!(
            "{}: {} {} {} -> {} ({:?})",
            self.name, request.side, request.quantity, request.symbol, ack.order_id, ack.status
        );

        Self::stall(stall).await;
        Ok(ack)
    }

    async fn cancel_order(&self, order_id: &str, nonce: Nonce) -> Result<bool> {
        let _tracked = self.track();
        let stall = self.enter(false).await?;

        let cancelled = {
            let mut book = self.book();
            Self::check_nonce(&mut book, nonce)?;
            let before = book.open_orders.len();
            book.open_orders.retain(|o| o.order_id != order_id);
            book.open_orders.len() < before
        };

        if cancelled {
            info!("{}: cancelled {}", self.name, order_id);
        }
        Self::stall(stall).await;
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exchange() -> PaperExchange {
        PaperExchange::new("paper")
            .with_balance("USD", dec!(1000))
            .with_price("BTC", dec!(100))
    }

    #[tokio::test]
    async fn test_market_buy_moves_cash_into_asset() {
        let ex = exchange();
        let ack = ex
            .place_order(&OrderRequest::market("BTC", OrderSide::Buy, dec!(2)), Nonce::for_test(1))
            .await
            .unwrap();

        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.avg_fill_price, Some(dec!(100)));
        assert_eq!(ex.balance("BTC"), dec!(2));
        assert_eq!(ex.balance("USD"), dec!(800));
    }

    #[tokio::test]
    async fn test_sell_beyond_holdings_is_rejected() {
        let ex = exchange().with_balance("BTC", dec!(1));
        let err = ex
            .place_order(&OrderRequest::liquidation("BTC", dec!(3)), Nonce::for_test(1))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::OrderRejected(_)));
        assert_eq!(ex.balance("BTC"), dec!(1));
    }

    #[tokio::test]
    async fn test_stale_nonce_is_rejected() {
        let ex = exchange();
        ex.fetch_balances(Nonce::for_test(10)).await.unwrap();

        let err = ex.fetch_open_orders(Nonce::for_test(10)).await.unwrap_err();
        assert!(matches!(
            err,
            KestrelError::NonceRejected { sent: 10, last_accepted: 10 }
        ));
        ex.fetch_open_orders(Nonce::for_test(11)).await.unwrap();
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_cancelled() {
        let ex = exchange();
        let ack = ex
            .place_order(
                &OrderRequest::limit("BTC", OrderSide::Buy, dec!(1), dec!(90)),
                Nonce::for_test(1),
            )
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(ex.fetch_open_orders(Nonce::for_test(2)).await.unwrap().len(), 1);

        assert!(ex.cancel_order(&ack.order_id, Nonce::for_test(3)).await.unwrap());
        assert!(ex.fetch_open_orders(Nonce::for_test(4)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let ex = exchange();
        ex.push_failure(ScriptedFailure::RateLimited);
        ex.push_failure(ScriptedFailure::AuthFailure);

        assert!(ex.fetch_price("BTC").await.unwrap_err().is_transient());
        assert!(ex.fetch_price("BTC").await.unwrap_err().is_permanent());
        assert_eq!(ex.fetch_price("BTC").await.unwrap(), dec!(100));
        assert_eq!(ex.call_count(), 3);
    }

    #[tokio::test]
    async fn test_missing_price_is_unavailable() {
        let ex = exchange();
        ex.remove_price("BTC");
        let err = ex.fetch_price("BTC").await.unwrap_err();
        assert!(matches!(err, KestrelError::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_frozen_fills_leave_balances_untouched() {
        let ex = exchange().with_balance("BTC", dec!(1));
        ex.set_fills_frozen(true);

        let ack = ex
            .place_order(&OrderRequest::liquidation("BTC", dec!(1)), Nonce::for_test(1))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(ex.balance("BTC"), dec!(1));
    }
}
