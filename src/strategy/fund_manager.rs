//! Capital reservation ledger
//!
//! Tracks, per account, capital committed to orders in flight and open
//! positions:
//! - Check-and-insert under a per-account lock, so concurrent decisions for
//!   one account can never jointly exceed `equity * (1 - safety_buffer)`
//! - Accounts never contend with each other
//! - A reservation whose order fate is unknown cannot be released

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::AccountId;
use crate::error::{ReservationError, Result};

/// Capital ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapitalConfig {
    /// Share of equity never committed (0.10 = 10%)
    pub safety_buffer_pct: Decimal,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            safety_buffer_pct: dec!(0.10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Capital held, order not yet sent
    Pending,
    /// Order sent, acknowledgement not yet processed
    Submitted,
    /// Submission outcome unknown (timeout, dropped connection)
    FateUnknown,
    /// Order accepted; capital backs an open position
    Active,
}

impl ReservationStatus {
    /// The exchange may or may not hold an order for this reservation
    pub fn is_unresolved(&self) -> bool {
        matches!(self, ReservationStatus::Submitted | ReservationStatus::FateUnknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub position_id: String,
    pub account_id: AccountId,
    pub symbol: String,
    pub amount: Decimal,
    pub status: ReservationStatus,
    pub client_order_id: Option<String>,
    pub order_id: Option<String>,
    /// Exchange holding of `symbol` just before submission
    pub baseline_quantity: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AccountLedger {
    equity: Decimal,
    reservations: HashMap<String, Reservation>,
}

impl AccountLedger {
    fn reserved_total(&self) -> Decimal {
        self.reservations.values().map(|r| r.amount).sum()
    }

    fn limit(&self, buffer: Decimal) -> Decimal {
        (self.equity * (Decimal::ONE - buffer)).max(Decimal::ZERO)
    }

    fn available(&self, buffer: Decimal) -> Decimal {
        (self.limit(buffer) - self.reserved_total()).max(Decimal::ZERO)
    }

    fn get_mut(&mut self, position_id: &str) -> Result<&mut Reservation> {
        self.reservations
            .get_mut(position_id)
            .ok_or_else(|| ReservationError::NotFound(position_id.to_string()).into())
    }
}

/// Point-in-time view of one account's ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub account_id: AccountId,
    pub equity: Decimal,
    pub limit: Decimal,
    pub reserved_total: Decimal,
    pub available: Decimal,
    pub reservations: usize,
    pub unresolved: usize,
}

pub struct CapitalReservationManager {
    config: CapitalConfig,
    ledgers: DashMap<AccountId, Arc<Mutex<AccountLedger>>>,
    /// position_id -> owning account
    index: DashMap<String, AccountId>,
}

impl CapitalReservationManager {
    pub fn new(config: CapitalConfig) -> Self {
        Self {
            config,
            ledgers: DashMap::new(),
            index: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CapitalConfig {
        &self.config
    }

    /// Create (or reset the equity of) an account's ledger
    pub async fn register_account(&self, account_id: AccountId, equity: Decimal) {
        let ledger = self
            .ledgers
            .entry(account_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AccountLedger::default())))
            .clone();
        ledger.lock().await.equity = equity;
        info!("[{}] capital ledger registered, equity {}", account_id, equity);
    }

    fn ledger(&self, account_id: &AccountId) -> Result<Arc<Mutex<AccountLedger>>> {
        // Clone the Arc so no map shard lock is held across an await
        self.ledgers
            .get(account_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| ReservationError::UnknownAccount(account_id.to_string()).into())
    }

    fn owner(&self, position_id: &str) -> Result<AccountId> {
        self.index
            .get(position_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| ReservationError::NotFound(position_id.to_string()).into())
    }

    /// Refresh equity from an exchange snapshot
    pub async fn update_equity(&self, account_id: &AccountId, equity: Decimal) -> Result<()> {
        let ledger = self.ledger(account_id)?;
        let mut ledger = ledger.lock().await;
        ledger.equity = equity;

        let reserved = ledger.reserved_total();
        let limit = ledger.limit(self.config.safety_buffer_pct);
        if reserved > limit {
            warn!(
                "[{}] reservations {} exceed limit {} after equity update; no new reservations",
                account_id, reserved, limit
            );
        }
        Ok(())
    }

    /// Reserve `amount` for `position_id`, failing with the reason on denial
    pub async fn reserve(
        &self,
        account_id: &AccountId,
        position_id: &str,
        symbol: &str,
        amount: Decimal,
    ) -> Result<Reservation> {
        if amount <= Decimal::ZERO {
            return Err(ReservationError::InvalidAmount(amount).into());
        }

        let ledger = self.ledger(account_id)?;
        let mut ledger = ledger.lock().await;

        if self.index.contains_key(position_id) {
            return Err(ReservationError::Duplicate(position_id.to_string()).into());
        }

        let available = ledger.available(self.config.safety_buffer_pct);
        if amount > available {
            return Err(ReservationError::Insufficient {
                requested: amount,
                available,
            }
            .into());
        }

        let now = Utc::now();
        let reservation = Reservation {
            position_id: position_id.to_string(),
            account_id: account_id.clone(),
            symbol: symbol.to_string(),
            amount,
            status: ReservationStatus::Pending,
            client_order_id: None,
            order_id: None,
            baseline_quantity: None,
            created_at: now,
            updated_at: now,
        };
        ledger
            .reservations
            .insert(position_id.to_string(), reservation.clone());
        self.index
            .insert(position_id.to_string(), account_id.clone());

        debug!(
            "[{}] reserved {} for {} ({}), {} left",
            account_id,
            amount,
            position_id,
            symbol,
            available - amount
        );
        Ok(reservation)
    }

    /// Atomic check-and-reserve. `false` for unknown accounts, non-positive
    /// amounts, duplicates and insufficient capital.
    pub async fn try_reserve(
        &self,
        account_id: &AccountId,
        position_id: &str,
        symbol: &str,
        amount: Decimal,
    ) -> bool {
        match self.reserve(account_id, position_id, symbol, amount).await {
            Ok(_) => true,
            Err(e) => {
                debug!("[{}] reservation denied: {}", account_id, e);
                false
            }
        }
    }

    async fn update<T>(
        &self,
        position_id: &str,
        f: impl FnOnce(&mut AccountLedger) -> Result<T>,
    ) -> Result<T> {
        let account_id = self.owner(position_id)?;
        let ledger = self.ledger(&account_id)?;
        let mut ledger = ledger.lock().await;
        f(&mut ledger)
    }

    /// The order is about to be sent
    pub async fn mark_submitted(
        &self,
        position_id: &str,
        client_order_id: &str,
        baseline_quantity: Decimal,
    ) -> Result<()> {
        self.update(position_id, |ledger| {
            let r = ledger.get_mut(position_id)?;
            r.status = ReservationStatus::Submitted;
            r.client_order_id = Some(client_order_id.to_string());
            r.baseline_quantity = Some(baseline_quantity);
            r.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// The exchange accepted the order
    pub async fn confirm_active(&self, position_id: &str, order_id: &str) -> Result<()> {
        self.update(position_id, |ledger| {
            let r = ledger.get_mut(position_id)?;
            r.status = ReservationStatus::Active;
            r.order_id = Some(order_id.to_string());
            r.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// The submission outcome is unknown; the reservation is pinned until resolved
    pub async fn mark_fate_unknown(&self, position_id: &str) -> Result<()> {
        self.update(position_id, |ledger| {
            let r = ledger.get_mut(position_id)?;
            warn!(
                "[{}] order fate unknown for {} ({}), holding {}",
                r.account_id, position_id, r.symbol, r.amount
            );
            r.status = ReservationStatus::FateUnknown;
            r.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// The exchange confirmed the order was rejected, cancelled or never
    /// received. Frees the capital whatever the recorded status.
    pub async fn resolve_rejected(&self, position_id: &str) -> Result<Reservation> {
        let removed = self
            .update(position_id, |ledger| {
                ledger
                    .reservations
                    .remove(position_id)
                    .ok_or_else(|| ReservationError::NotFound(position_id.to_string()).into())
            })
            .await?;
        self.index.remove(position_id);
        debug!(
            "[{}] reservation {} resolved as not placed, {} freed",
            removed.account_id, position_id, removed.amount
        );
        Ok(removed)
    }

    /// Release capital for a closed position or an order never sent.
    ///
    /// Refused while the order's fate is unresolved.
    pub async fn release(&self, position_id: &str) -> Result<Reservation> {
        let removed = self
            .update(position_id, |ledger| {
                let r = ledger.get_mut(position_id)?;
                if r.status.is_unresolved() {
                    return Err(ReservationError::FateUnresolved {
                        position_id: position_id.to_string(),
                    }
                    .into());
                }
                ledger
                    .reservations
                    .remove(position_id)
                    .ok_or_else(|| ReservationError::NotFound(position_id.to_string()).into())
            })
            .await?;
        self.index.remove(position_id);
        debug!(
            "[{}] released {} from {}",
            removed.account_id, removed.amount, position_id
        );
        Ok(removed)
    }

    pub async fn reservation(&self, position_id: &str) -> Option<Reservation> {
        self.update(position_id, |ledger| {
            ledger
                .reservations
                .get(position_id)
                .cloned()
                .ok_or_else(|| ReservationError::NotFound(position_id.to_string()).into())
        })
        .await
        .ok()
    }

    /// All reservations of an account, oldest first
    pub async fn reservations(&self, account_id: &AccountId) -> Result<Vec<Reservation>> {
        let ledger = self.ledger(account_id)?;
        let ledger = ledger.lock().await;
        let mut reservations: Vec<Reservation> = ledger.reservations.values().cloned().collect();
        reservations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(reservations)
    }

    pub async fn snapshot(&self, account_id: &AccountId) -> Result<LedgerSnapshot> {
        let ledger = self.ledger(account_id)?;
        let ledger = ledger.lock().await;
        let buffer = self.config.safety_buffer_pct;
        Ok(LedgerSnapshot {
            account_id: account_id.clone(),
            equity: ledger.equity,
            limit: ledger.limit(buffer),
            reserved_total: ledger.reserved_total(),
            available: ledger.available(buffer),
            reservations: ledger.reservations.len(),
            unresolved: ledger
                .reservations
                .values()
                .filter(|r| r.status.is_unresolved())
                .count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KestrelError;

    async fn manager_with(accounts: &[(&str, Decimal)]) -> Arc<CapitalReservationManager> {
        let manager = Arc::new(CapitalReservationManager::new(CapitalConfig::default()));
        for (id, equity) in accounts {
            manager.register_account(AccountId::from(*id), *equity).await;
        }
        manager
    }

    #[tokio::test]
    async fn test_reserve_respects_safety_buffer() {
        let manager = manager_with(&[("master", dec!(1000))]).await;
        let master = AccountId::from("master");

        assert!(manager.try_reserve(&master, "p1", "BTC", dec!(500)).await);
        assert!(manager.try_reserve(&master, "p2", "ETH", dec!(400)).await);
        assert!(!manager.try_reserve(&master, "p3", "SOL", dec!(1)).await);

        let snap = manager.snapshot(&master).await.unwrap();
        assert_eq!(snap.limit, dec!(900));
        assert_eq!(snap.reserved_total, dec!(900));
        assert_eq!(snap.available, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_denied() {
        let manager = manager_with(&[("master", dec!(1000))]).await;
        let master = AccountId::from("master");

        assert!(!manager.try_reserve(&AccountId::from("nobody"), "p1", "BTC", dec!(1)).await);
        assert!(!manager.try_reserve(&master, "p1", "BTC", dec!(0)).await);
        assert!(!manager.try_reserve(&master, "p1", "BTC", dec!(-5)).await);

        assert!(manager.try_reserve(&master, "p1", "BTC", dec!(10)).await);
        let err = manager.reserve(&master, "p1", "BTC", dec!(10)).await.unwrap_err();
        assert!(matches!(
            err,
            KestrelError::Reservation(ReservationError::Duplicate(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_exceed_limit() {
        let manager = manager_with(&[("master", dec!(1000))]).await;

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .try_reserve(&AccountId::from("master"), &format!("p{}", i), "BTC", dec!(100))
                        .await
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 9);
        let snap = manager.snapshot(&AccountId::from("master")).await.unwrap();
        assert_eq!(snap.reserved_total, dec!(900));
        assert!(snap.reserved_total <= snap.limit);
    }

    #[tokio::test]
    async fn test_unknown_fate_pins_reservation() {
        let manager = manager_with(&[("user-1", dec!(100))]).await;
        let user = AccountId::from("user-1");

        manager.reserve(&user, "p1", "BTC", dec!(50)).await.unwrap();
        manager.mark_submitted("p1", "coid-1", Decimal::ZERO).await.unwrap();
        manager.mark_fate_unknown("p1").await.unwrap();

        let err = manager.release("p1").await.unwrap_err();
        assert!(matches!(
            err,
            KestrelError::Reservation(ReservationError::FateUnresolved { .. })
        ));
        assert_eq!(manager.snapshot(&user).await.unwrap().unresolved, 1);

        let freed = manager.resolve_rejected("p1").await.unwrap();
        assert_eq!(freed.amount, dec!(50));
        assert_eq!(manager.snapshot(&user).await.unwrap().reserved_total, Decimal::ZERO);
        assert!(manager.reservation("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_active_reservation_releases_on_close() {
        let manager = manager_with(&[("user-1", dec!(100))]).await;
        let user = AccountId::from("user-1");

        manager.reserve(&user, "p1", "ETH", dec!(30)).await.unwrap();
        manager.mark_submitted("p1", "coid-1", dec!(2)).await.unwrap();
        assert!(manager.release("p1").await.is_err());

        manager.confirm_active("p1", "ord-9").await.unwrap();
        let r = manager.reservation("p1").await.unwrap();
        assert_eq!(r.status, ReservationStatus::Active);
        assert_eq!(r.baseline_quantity, Some(dec!(2)));

        manager.release("p1").await.unwrap();
        assert!(manager.reservations(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let manager = manager_with(&[("a", dec!(100)), ("b", dec!(100))]).await;

        assert!(manager.try_reserve(&AccountId::from("a"), "a1", "BTC", dec!(90)).await);
        assert!(!manager.try_reserve(&AccountId::from("a"), "a2", "BTC", dec!(1)).await);
        assert!(manager.try_reserve(&AccountId::from("b"), "b1", "BTC", dec!(90)).await);
    }

    #[tokio::test]
    async fn test_equity_drop_blocks_new_reservations() {
        let manager = manager_with(&[("a", dec!(1000))]).await;
        let a = AccountId::from("a");

        assert!(manager.try_reserve(&a, "p1", "BTC", dec!(500)).await);
        manager.update_equity(&a, dec!(400)).await.unwrap();
        assert!(!manager.try_reserve(&a, "p2", "BTC", dec!(1)).await);
        assert_eq!(manager.snapshot(&a).await.unwrap().available, Decimal::ZERO);
    }
}
