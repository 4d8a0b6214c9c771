//! Position Reconciliation & Cap Enforcement
//!
//! The exchange is the source of truth for holdings:
//! - Snapshots are always fetched from the exchange, never from the local book
//! - Positions without an obtainable price are `Unvaluable`, excluded from
//!   counts and exposure, and their symbol is blocked for trading
//! - Dust is excluded from counts and from liquidation candidates
//! - The open-position cap is enforced by liquidating the smallest positions
//!   and re-fetching until compliant, or latching the global halt

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordination::halt::{HaltReason, TradingHalt};
use crate::domain::{AccountId, OrderRequest, OrderSide, Position, Valuation};
use crate::error::{KestrelError, Result};
use crate::exchange::AccountGateway;

/// Cap enforcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapConfig {
    /// Maximum concurrently open (material) positions per account
    pub max_positions: usize,
    /// Positions worth less than this are dust
    pub dust_threshold: Decimal,
    /// Wait between a liquidation round and the verifying re-fetch
    pub settlement_interval_ms: u64,
    /// Liquidation rounds before giving up and halting
    pub max_cycles: u32,
    /// Asset balances are valued in
    pub quote_asset: String,
    /// Assets that are never positions (fee tokens, stablecoins)
    pub ignored_assets: Vec<String>,
    /// Local/exchange difference below this is informational (5%)
    pub warning_threshold_pct: Decimal,
    /// Local/exchange difference at or above this is critical (20%)
    pub critical_threshold_pct: Decimal,
}

impl Default for CapConfig {
    fn default() -> Self {
        Self {
            max_positions: 8,
            dust_threshold: dec!(1),
            settlement_interval_ms: 2000,
            max_cycles: 3,
            quote_asset: "USD".to_string(),
            ignored_assets: Vec::new(),
            warning_threshold_pct: dec!(0.05),
            critical_threshold_pct: dec!(0.20),
        }
    }
}

/// Holdings fetched from the exchange at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub account_id: AccountId,
    pub positions: Vec<Position>,
    pub quote_balance: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    /// Positions that count toward the cap, smallest notional first
    pub fn material(&self, dust_threshold: Decimal) -> Vec<&Position> {
        let mut material: Vec<&Position> = self
            .positions
            .iter()
            .filter(|p| p.is_material(dust_threshold))
            .collect();
        material.sort_by(|a, b| {
            a.notional()
                .cmp(&b.notional())
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        material
    }

    pub fn unvaluable(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| !p.valuation.is_valuable())
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Quote balance plus every priced holding. Unvaluable holdings add nothing.
    pub fn equity(&self) -> Decimal {
        self.quote_balance
            + self
                .positions
                .iter()
                .filter_map(|p| p.notional())
                .sum::<Decimal>()
    }
}

/// Local cache of holdings, re-derived from every exchange fetch
#[derive(Debug, Default)]
pub struct PositionBook {
    quantities: RwLock<HashMap<String, Decimal>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fill reported by an order acknowledgement
    pub fn apply_fill(&self, symbol: &str, side: OrderSide, quantity: Decimal) {
        let mut quantities = self.quantities.write().unwrap_or_else(|p| p.into_inner());
        let entry = quantities.entry(symbol.to_string()).or_default();
        match side {
            OrderSide::Buy => *entry += quantity,
            OrderSide::Sell => *entry -= quantity,
        }
        if *entry <= Decimal::ZERO {
            quantities.remove(symbol);
        }
    }

    pub fn quantity(&self, symbol: &str) -> Decimal {
        self.quantities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    pub fn quantities(&self) -> HashMap<String, Decimal> {
        self.quantities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Replace the cache wholesale with exchange-reported holdings
    pub fn replace(&self, quantities: HashMap<String, Decimal>) {
        *self.quantities.write().unwrap_or_else(|p| p.into_inner()) = quantities;
    }
}

/// Summary of one `enforce_cap` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapReport {
    pub account_id: AccountId,
    pub max_positions: usize,
    /// Material positions at the last fetch
    pub open_positions: usize,
    /// Liquidation rounds performed
    pub cycles: u32,
    pub liquidated: Vec<String>,
    pub failed_liquidations: Vec<String>,
    pub unvaluable: Vec<String>,
    pub dust: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CapOutcome {
    Compliant(CapReport),
    Halted(CapReport),
}

impl CapOutcome {
    pub fn is_compliant(&self) -> bool {
        matches!(self, CapOutcome::Compliant(_))
    }

    pub fn report(&self) -> &CapReport {
        match self {
            CapOutcome::Compliant(report) | CapOutcome::Halted(report) => report,
        }
    }
}

/// Discrepancy severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscrepancySeverity {
    /// Minor difference (< 5%)
    Info,
    /// Moderate difference (5-20%)
    Warning,
    /// Major difference (>= 20%), or a holding one side does not know about
    Critical,
}

impl std::fmt::Display for DiscrepancySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscrepancySeverity::Info => write!(f, "INFO"),
            DiscrepancySeverity::Warning => write!(f, "WARNING"),
            DiscrepancySeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDiscrepancy {
    pub symbol: String,
    pub local_quantity: Decimal,
    pub exchange_quantity: Decimal,
    pub difference: Decimal,
    pub severity: DiscrepancySeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub timestamp: DateTime<Utc>,
    pub discrepancies_found: usize,
    pub critical_issues: usize,
    pub duration_ms: u64,
    pub discrepancies: Vec<PositionDiscrepancy>,
}

/// Per-account reconciler and cap enforcer
pub struct PositionReconciler {
    gateway: AccountGateway,
    config: CapConfig,
    halt: Arc<TradingHalt>,
    book: PositionBook,
    blocked: DashSet<String>,
}

impl PositionReconciler {
    pub fn new(gateway: AccountGateway, config: CapConfig, halt: Arc<TradingHalt>) -> Self {
        Self {
            gateway,
            config,
            halt,
            book: PositionBook::new(),
            blocked: DashSet::new(),
        }
    }

    pub fn account_id(&self) -> &AccountId {
        self.gateway.account_id()
    }

    pub fn config(&self) -> &CapConfig {
        &self.config
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    /// Trading on `symbol` is paused because its price could not be obtained
    pub fn is_symbol_blocked(&self, symbol: &str) -> bool {
        self.blocked.contains(symbol)
    }

    pub fn blocked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.blocked.iter().map(|s| s.key().clone()).collect();
        symbols.sort();
        symbols
    }

    fn is_position_asset(&self, asset: &str) -> bool {
        asset != self.config.quote_asset && !self.config.ignored_assets.iter().any(|a| a == asset)
    }

    /// Fetch holdings and prices from the exchange and re-derive the book.
    ///
    /// Missing prices make a position `Unvaluable`. Any other failure (the
    /// circuit is open, a timeout) fails the whole snapshot rather than
    /// undercounting.
    pub async fn snapshot(&self) -> Result<PortfolioSnapshot> {
        let balances = self.gateway.fetch_balances().await?;

        let mut quote_balance = Decimal::ZERO;
        let mut holdings = Vec::new();
        for balance in balances {
            let quantity = balance.total();
            if quantity <= Decimal::ZERO {
                continue;
            }
            if balance.asset == self.config.quote_asset {
                quote_balance = quantity;
            } else if self.is_position_asset(&balance.asset) {
                holdings.push((balance.asset, quantity));
            }
        }

        let mut positions = Vec::with_capacity(holdings.len());
        for (symbol, quantity) in &holdings {
            let valuation = match self.gateway.fetch_price(symbol).await {
                Ok(price) => {
                    if self.blocked.remove(symbol).is_some() {
                        info!("[{}] {} is priced again, unblocked", self.account_id(), symbol);
                    }
                    Valuation::priced(price, *quantity)
                }
                Err(KestrelError::PriceUnavailable { reason, .. }) => {
                    if self.blocked.insert(symbol.clone()) {
                        warn!(
                            "[{}] {} has no obtainable price ({}); excluded and blocked",
                            self.account_id(),
                            symbol,
                            reason
                        );
                    }
                    Valuation::Unvaluable { reason }
                }
                Err(e) => return Err(e),
            };

            positions.push(Position {
                account_id: self.account_id().clone(),
                symbol: symbol.clone(),
                quantity: *quantity,
                valuation,
            });
        }

        self.book.replace(holdings.into_iter().collect());

        Ok(PortfolioSnapshot {
            account_id: self.account_id().clone(),
            positions,
            quote_balance,
            fetched_at: Utc::now(),
        })
    }

    /// Bring the number of material positions down to `max_positions`.
    ///
    /// Each round market-sells the smallest excess positions, waits the
    /// settlement interval and re-fetches. After `max_cycles` rounds without
    /// compliance the global halt is latched and `Halted` is returned.
    pub async fn enforce_cap(&self, max_positions: usize) -> Result<CapOutcome> {
        let max_cycles = self.config.max_cycles.max(1);
        let settlement = Duration::from_millis(self.config.settlement_interval_ms);

        let mut cycles = 0u32;
        let mut liquidated = Vec::new();
        let mut failed = Vec::new();

        loop {
            let snapshot = self.snapshot().await?;
            let material = snapshot.material(self.config.dust_threshold);

            let report = CapReport {
                account_id: self.account_id().clone(),
                max_positions,
                open_positions: material.len(),
                cycles,
                liquidated: liquidated.clone(),
                failed_liquidations: failed.clone(),
                unvaluable: snapshot.unvaluable().map(|p| p.symbol.clone()).collect(),
                dust: snapshot
                    .positions
                    .iter()
                    .filter(|p| p.is_dust(self.config.dust_threshold))
                    .map(|p| p.symbol.clone())
                    .collect(),
            };

            if material.len() <= max_positions {
                debug!(
                    "[{}] cap compliant: {}/{} open positions",
                    self.account_id(),
                    material.len(),
                    max_positions
                );
                return Ok(CapOutcome::Compliant(report));
            }

            if cycles >= max_cycles {
                error!(
                    "[{}] position cap did not converge: {} open, cap {}, after {} cycles",
                    self.account_id(),
                    material.len(),
                    max_positions,
                    cycles
                );
                self.halt.trip(HaltReason::CapNotConverged {
                    account_id: self.account_id().to_string(),
                    open_positions: material.len(),
                    max_positions,
                    cycles,
                });
                return Ok(CapOutcome::Halted(report));
            }

            cycles += 1;
            let excess = material.len() - max_positions;
            warn!(
                "[{}] {} open positions exceed cap {}; liquidating {} smallest (round {}/{})",
                self.account_id(),
                material.len(),
                max_positions,
                excess,
                cycles,
                max_cycles
            );

            for position in material.into_iter().take(excess) {
                let request = OrderRequest::liquidation(&position.symbol, position.quantity);
                match self.gateway.place_exit_order(&request).await {
                    Ok(ack) => {
                        info!(
                            "[{}] liquidated {} {} (notional {:?}) as {}",
                            self.account_id(),
                            position.quantity,
                            position.symbol,
                            position.notional(),
                            ack.order_id
                        );
                        self.book
                            .apply_fill(&position.symbol, OrderSide::Sell, ack.filled_quantity);
                        liquidated.push(position.symbol.clone());
                    }
                    Err(e) => {
                        warn!(
                            "[{}] liquidation of {} failed: {}",
                            self.account_id(),
                            position.symbol,
                            e
                        );
                        failed.push(position.symbol.clone());
                    }
                }
            }

            tokio::time::sleep(settlement).await;
        }
    }

    /// Compare the local book against the exchange, then re-derive the book
    /// from the exchange
    pub async fn reconcile(&self) -> Result<ReconciliationResult> {
        let start = Instant::now();

        let local = self.book.quantities();
        let exchange: HashMap<String, Decimal> = self
            .gateway
            .fetch_balances()
            .await?
            .into_iter()
            .filter(|b| b.total() > Decimal::ZERO && self.is_position_asset(&b.asset))
            .map(|b| {
                let total = b.total();
                (b.asset, total)
            })
            .collect();

        let symbols: HashSet<&String> = local.keys().chain(exchange.keys()).collect();
        let mut discrepancies: Vec<PositionDiscrepancy> = symbols
            .into_iter()
            .filter_map(|symbol| {
                let local_quantity = local.get(symbol).copied().unwrap_or_default();
                let exchange_quantity = exchange.get(symbol).copied().unwrap_or_default();
                if local_quantity == exchange_quantity {
                    return None;
                }
                Some(PositionDiscrepancy {
                    symbol: symbol.clone(),
                    local_quantity,
                    exchange_quantity,
                    difference: local_quantity - exchange_quantity,
                    severity: self.calculate_severity(local_quantity, exchange_quantity),
                })
            })
            .collect();
        discrepancies.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        for disc in &discrepancies {
            match disc.severity {
                DiscrepancySeverity::Critical => error!(
                    "[{}] CRITICAL position mismatch for {}: local={}, exchange={}",
                    self.account_id(),
                    disc.symbol,
                    disc.local_quantity,
                    disc.exchange_quantity
                ),
                DiscrepancySeverity::Warning => warn!(
                    "[{}] position mismatch for {}: local={}, exchange={}",
                    self.account_id(),
                    disc.symbol,
                    disc.local_quantity,
                    disc.exchange_quantity
                ),
                DiscrepancySeverity::Info => debug!(
                    "[{}] minor drift on {}: local={}, exchange={}",
                    self.account_id(),
                    disc.symbol,
                    disc.local_quantity,
                    disc.exchange_quantity
                ),
            }
        }

        self.book.replace(exchange);

        let critical_issues = discrepancies
            .iter()
            .filter(|d| d.severity == DiscrepancySeverity::Critical)
            .count();

        Ok(ReconciliationResult {
            timestamp: Utc::now(),
            discrepancies_found: discrepancies.len(),
            critical_issues,
            duration_ms: start.elapsed().as_millis() as u64,
            discrepancies,
        })
    }

    fn calculate_severity(&self, local: Decimal, exchange: Decimal) -> DiscrepancySeverity {
        if exchange.is_zero() || local.is_zero() {
            return DiscrepancySeverity::Critical;
        }

        let diff_pct = (local - exchange).abs() / exchange.abs();
        if diff_pct >= self.config.critical_threshold_pct {
            DiscrepancySeverity::Critical
        } else if diff_pct >= self.config.warning_threshold_pct {
            DiscrepancySeverity::Warning
        } else {
            DiscrepancySeverity::Info
        }
    }
}
