//! Account Gateway
//!
//! The single path from an account loop to its exchange. Every authenticated
//! call goes: call serializer → circuit breaker gate → nonce authority →
//! timed exchange call → outcome recorded on the breaker.

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::coordination::circuit_breaker::{
    CircuitBreakerConfig, ExchangeCircuitBreaker, ExchangeHealth,
};
use crate::domain::{AccountId, Balance, OpenOrder, OrderAck, OrderRequest, OrderSide};
use crate::error::{KestrelError, Result};
use crate::exchange::ExchangeClient;
use crate::signing::{CallSerializer, Nonce, NonceAuthority};

/// Guards shared by every account trading on one exchange
pub struct ExchangeGuards {
    name: String,
    breaker: ExchangeCircuitBreaker,
    serializer: CallSerializer,
}

impl ExchangeGuards {
    pub fn new(name: impl Into<String>, breaker_config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        Self {
            breaker: ExchangeCircuitBreaker::new(name.clone(), breaker_config),
            serializer: CallSerializer::new(name.clone()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &ExchangeCircuitBreaker {
        &self.breaker
    }

    pub fn serializer(&self) -> &CallSerializer {
        &self.serializer
    }
}

/// One account's view of its exchange: isolated credentials (inside `client`),
/// shared breaker and serializer, shared nonce authority
#[derive(Clone)]
pub struct AccountGateway {
    account_id: AccountId,
    client: Arc<dyn ExchangeClient>,
    guards: Arc<ExchangeGuards>,
    nonces: Arc<NonceAuthority>,
}

impl AccountGateway {
    pub fn new(
        account_id: AccountId,
        client: Arc<dyn ExchangeClient>,
        guards: Arc<ExchangeGuards>,
        nonces: Arc<NonceAuthority>,
    ) -> Self {
        Self {
            account_id,
            client,
            guards,
            nonces,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn exchange(&self) -> &str {
        self.guards.name()
    }

    pub fn health(&self) -> ExchangeHealth {
        self.guards.breaker.health()
    }

    pub fn guards(&self) -> &Arc<ExchangeGuards> {
        &self.guards
    }

    async fn authenticated<T, F, Fut>(&self, operation: &str, lenient: bool, f: F) -> Result<T>
    where
        F: FnOnce(Nonce) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = &self.guards.breaker;
        let nonces = &self.nonces;

        let result = self
            .guards
            .serializer
            .with_lock(|| async move {
                // Gate after the wait: a call queued behind one that tripped
                // the circuit must not reach the exchange.
                let permit = breaker.acquire(lenient)?;

                // Drawn under the lock: this nonce reaches the exchange before
                // the next one exists. A timed-out call's nonce is never reused.
                // A local store failure drops the permit unrecorded; it says
                // nothing about the exchange.
                let nonce = nonces.next().await?;

                let result = breaker.timed(operation, f(nonce)).await;
                permit.complete(&result);
                result
            })
            .await;

        if let Err(ref e) = result {
            warn!(
                "[{}] {} on {} failed ({}): {}",
                self.account_id,
                operation,
                self.guards.name,
                e.class(),
                e
            );
        }
        result
    }

    pub async fn fetch_balances(&self) -> Result<Vec<Balance>> {
        self.authenticated("fetch_balances", false, |nonce| {
            self.client.fetch_balances(nonce)
        })
        .await
    }

    /// Balance query through the exit path
    pub async fn fetch_balances_lenient(&self) -> Result<Vec<Balance>> {
        self.authenticated("fetch_balances", true, |nonce| {
            self.client.fetch_balances(nonce)
        })
        .await
    }

    pub async fn fetch_open_orders(&self) -> Result<Vec<OpenOrder>> {
        self.authenticated("fetch_open_orders", false, |nonce| {
            self.client.fetch_open_orders(nonce)
        })
        .await
    }

    /// Open-order query through the exit path
    pub async fn fetch_open_orders_lenient(&self) -> Result<Vec<OpenOrder>> {
        self.authenticated("fetch_open_orders", true, |nonce| {
            self.client.fetch_open_orders(nonce)
        })
        .await
    }

    /// Public price read: breaker-gated, not serialized, no nonce
    pub async fn fetch_price(&self, symbol: &str) -> Result<Decimal> {
        let price = self
            .guards
            .breaker
            .call_guarded("fetch_price", || self.client.fetch_price(symbol))
            .await?;

        if price <= Decimal::ZERO {
            return Err(KestrelError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: format!("non-positive quote {}", price),
            });
        }
        Ok(price)
    }

    /// Place an order that may open or grow a position
    pub async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let ack = self
            .authenticated("place_order", false, |nonce| {
                self.client.place_order(request, nonce)
            })
            .await?;

        debug!(
            "[{}] {} {} {} accepted as {} (nonce {})",
            self.account_id, request.side, request.quantity, request.symbol, ack.order_id, ack.nonce
        );
        Ok(ack)
    }

    /// Place a position-reducing order through the exit path
    pub async fn place_exit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if request.side != OrderSide::Sell {
            return Err(KestrelError::Validation(format!(
                "exit path only accepts sells, got {} {}",
                request.side, request.symbol
            )));
        }

        self.authenticated("place_exit_order", true, |nonce| {
            self.client.place_order(request, nonce)
        })
        .await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.authenticated("cancel_order", true, |nonce| {
            self.client.cancel_order(order_id, nonce)
        })
        .await
    }
}
