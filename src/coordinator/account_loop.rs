//! Account Loop
//!
//! One independent control loop per account:
//! `Idle → Scanning → Deciding → Reserving → Submitting → Settling → Idle`.
//! Every failure is caught here. A permanent error parks the loop in
//! `Paused` until an operator resumes it; anything else is logged and the
//! next cycle runs as usual. Nothing in one loop can stall another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coordination::{ExchangeHealth, StopToken, TradingHalt};
use crate::domain::{AccountId, AccountRole, OrderStatus};
use crate::error::{CapError, KestrelError, Result};
use crate::exchange::AccountGateway;
use crate::strategy::{
    CapOutcome, CapitalReservationManager, PortfolioSnapshot, PositionReconciler,
    ReservationStatus, SignalContext, SignalSource, TradeSignal,
};

use super::command::AccountCommand;
use super::config::OrchestratorConfig;
use super::state::{AccountStatus, CycleOutcome, LoopError, LoopState};

/// Everything one account loop needs
pub struct AccountRuntime {
    pub account_id: AccountId,
    pub role: AccountRole,
    pub gateway: AccountGateway,
    pub reconciler: Arc<PositionReconciler>,
    pub capital: Arc<CapitalReservationManager>,
    pub signals: Arc<dyn SignalSource>,
    pub halt: Arc<TradingHalt>,
}

pub(crate) struct AccountLoop {
    rt: AccountRuntime,
    config: OrchestratorConfig,
    status: Arc<RwLock<AccountStatus>>,
    commands: mpsc::Receiver<AccountCommand>,
    stop: StopToken,
    cycle: u64,
}

impl AccountLoop {
    pub(crate) fn new(
        rt: AccountRuntime,
        config: OrchestratorConfig,
        status: Arc<RwLock<AccountStatus>>,
        commands: mpsc::Receiver<AccountCommand>,
        stop: StopToken,
    ) -> Self {
        Self {
            rt,
            config,
            status,
            commands,
            stop,
            cycle: 0,
        }
    }

    fn id(&self) -> &AccountId {
        &self.rt.account_id
    }

    async fn set_state(&self, state: LoopState) {
        self.status.write().await.state = state;
    }

    async fn state(&self) -> LoopState {
        self.status.read().await.state
    }

    async fn apply_command(&self, command: AccountCommand) {
        match command {
            AccountCommand::Resume => {
                let mut status = self.status.write().await;
                if status.state == LoopState::Paused {
                    info!("[{}] resumed by operator", self.rt.account_id);
                    status.state = LoopState::Idle;
                }
            }
            AccountCommand::Pause(reason) => {
                warn!("[{}] paused by operator: {}", self.rt.account_id, reason);
                let mut status = self.status.write().await;
                status.state = LoopState::Paused;
                status.last_skip_reason = Some(format!("paused: {}", reason));
            }
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            "[{}] {} account loop started on {} (every {}ms)",
            self.rt.account_id,
            self.rt.role,
            self.rt.gateway.exchange(),
            self.config.cycle_interval_ms
        );
        let interval = Duration::from_millis(self.config.cycle_interval_ms);
        self.rt
            .capital
            .register_account(self.rt.account_id.clone(), Decimal::ZERO)
            .await;

        loop {
            if self.stop.is_requested() {
                break;
            }

            while let Ok(command) = self.commands.try_recv() {
                self.apply_command(command).await;
            }

            if self.state().await == LoopState::Paused {
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => self.apply_command(command).await,
                        None => break,
                    },
                    _ = self.stop.wait() => break,
                }
                continue;
            }

            let outcome = self.run_cycle().await;
            self.cycle += 1;
            self.record(outcome).await;

            if self.stop.sleep(interval).await {
                break;
            }
        }

        self.set_state(LoopState::Stopped).await;
        info!("[{}] account loop stopped", self.rt.account_id);
    }

    async fn record(&self, outcome: Result<CycleOutcome>) {
        let mut status = self.status.write().await;
        status.last_cycle_at = Some(Utc::now());

        match outcome {
            Ok(CycleOutcome::Completed { orders }) => {
                status.cycles_completed += 1;
                status.orders_submitted += orders;
                status.state = LoopState::Idle;
            }
            Ok(CycleOutcome::Skipped(reason)) => {
                debug!("[{}] cycle skipped: {}", self.rt.account_id, reason);
                status.cycles_skipped += 1;
                status.last_skip_reason = Some(reason);
                status.state = LoopState::Idle;
            }
            Err(e) => {
                status.cycles_skipped += 1;
                if e.is_permanent() {
                    error!(
                        "[{}] permanent error, pausing until resumed: {}",
                        self.rt.account_id, e
                    );
                    status.state = LoopState::Paused;
                } else {
                    warn!("[{}] cycle failed ({}): {}", self.rt.account_id, e.class(), e);
                    status.state = LoopState::Idle;
                }
                status.last_error = Some(LoopError::from_error(&e));
            }
        }
    }

    async fn run_cycle(&self) -> Result<CycleOutcome> {
        if self.rt.gateway.health() == ExchangeHealth::Offline {
            return Ok(CycleOutcome::Skipped(format!(
                "{} offline (circuit open)",
                self.rt.gateway.exchange()
            )));
        }

        self.set_state(LoopState::Scanning).await;
        // Before the snapshot, which re-derives the book on its own
        if self.config.reconcile_every_cycles > 0
            && self.cycle > 0
            && self.cycle % self.config.reconcile_every_cycles == 0
        {
            let result = self.rt.reconciler.reconcile().await?;
            if result.discrepancies_found > 0 {
                info!(
                    "[{}] reconciliation re-derived {} holdings ({} critical)",
                    self.rt.account_id, result.discrepancies_found, result.critical_issues
                );
            }
        }

        let snapshot = self.rt.reconciler.snapshot().await?;
        self.rt
            .capital
            .update_equity(self.id(), snapshot.equity())
            .await?;

        let skip = self.gate(&snapshot).await?;

        let mut orders = 0;
        if skip.is_none() {
            self.set_state(LoopState::Deciding).await;
            let signals = self.decide(snapshot.clone()).await?;
            for signal in signals {
                if self.execute(&signal, &snapshot).await? {
                    orders += 1;
                }
            }
        }

        self.set_state(LoopState::Settling).await;
        self.settle().await?;

        Ok(match skip {
            Some(reason) => CycleOutcome::Skipped(reason),
            None => CycleOutcome::Completed { orders },
        })
    }

    /// Halt and periodic cap check. Returns the reason to skip trading.
    async fn gate(&self, snapshot: &PortfolioSnapshot) -> Result<Option<String>> {
        if self.rt.halt.is_halted() {
            return Ok(Some("trading halted system-wide".to_string()));
        }

        let every = self.config.cap_check_every_cycles.max(1);
        if self.cycle % every == 0 {
            let max = self.rt.reconciler.config().max_positions;
            let material = snapshot.material(self.rt.reconciler.config().dust_threshold).len();
            if material > max {
                match self.rt.reconciler.enforce_cap(max).await? {
                    CapOutcome::Compliant(report) => {
                        info!(
                            "[{}] cap restored: liquidated {:?}",
                            self.rt.account_id, report.liquidated
                        );
                    }
                    CapOutcome::Halted(report) => {
                        let reason = CapError::Halted {
                            cycles: report.cycles,
                            open_positions: report.open_positions,
                            max_positions: report.max_positions,
                        };
                        return Ok(Some(reason.to_string()));
                    }
                }
                // Liquidations moved holdings; decide on the next cycle's fetch
                return Ok(Some("cap enforcement ran this cycle".to_string()));
            }
        }

        Ok(None)
    }

    async fn decide(&self, snapshot: PortfolioSnapshot) -> Result<Vec<TradeSignal>> {
        let ctx = SignalContext {
            account_id: self.rt.account_id.clone(),
            role: self.rt.role,
            cycle: self.cycle,
            snapshot,
            blocked_symbols: self.rt.reconciler.blocked_symbols(),
        };

        let signals = self.rt.signals.evaluate(&ctx).await?;
        Ok(signals
            .into_iter()
            .filter(|s| {
                if s.quantity <= Decimal::ZERO {
                    warn!("[{}] dropping signal with quantity {}", self.rt.account_id, s.quantity);
                    return false;
                }
                if self.rt.reconciler.is_symbol_blocked(&s.symbol) {
                    warn!(
                        "[{}] {} is blocked (no price), dropping {} signal",
                        self.rt.account_id, s.symbol, s.side
                    );
                    return false;
                }
                true
            })
            .collect())
    }

    /// Reserve, submit and record one signal. Returns whether an order was placed.
    async fn execute(&self, signal: &TradeSignal, snapshot: &PortfolioSnapshot) -> Result<bool> {
        let request = signal.to_order_request();
        let baseline = snapshot
            .position(&signal.symbol)
            .map(|p| p.quantity)
            .unwrap_or_default();

        if !signal.needs_capital() {
            self.set_state(LoopState::Submitting).await;
            return match self.rt.gateway.place_order(&request).await {
                Ok(ack) => {
                    self.rt
                        .reconciler
                        .book()
                        .apply_fill(&signal.symbol, signal.side, ack.filled_quantity);
                    Ok(true)
                }
                Err(e) if e.is_permanent() => Err(e),
                Err(e) => {
                    warn!("[{}] sell of {} not placed: {}", self.rt.account_id, signal.symbol, e);
                    Ok(false)
                }
            };
        }

        self.set_state(LoopState::Reserving).await;
        let price = match signal.limit_price {
            Some(price) => price,
            None => match self.rt.gateway.fetch_price(&signal.symbol).await {
                Ok(price) => price,
                Err(e @ KestrelError::PriceUnavailable { .. }) => {
                    warn!("[{}] skipping {}: {}", self.rt.account_id, signal.symbol, e);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            },
        };

        let amount = price * signal.quantity;
        let position_id = Uuid::new_v4().to_string();
        if !self
            .rt
            .capital
            .try_reserve(self.id(), &position_id, &signal.symbol, amount)
            .await
        {
            info!(
                "[{}] insufficient capital for {} {} ({}), skipping",
                self.rt.account_id, signal.quantity, signal.symbol, amount
            );
            return Ok(false);
        }

        // Health may have changed while reserving
        if self.rt.gateway.health() == ExchangeHealth::Offline {
            self.rt.capital.release(&position_id).await?;
            return Ok(false);
        }

        self.set_state(LoopState::Submitting).await;
        self.rt
            .capital
            .mark_submitted(&position_id, &request.client_order_id, baseline)
            .await?;

        match self.rt.gateway.place_order(&request).await {
            Ok(ack) if matches!(ack.status, OrderStatus::Rejected | OrderStatus::Cancelled) => {
                self.rt.capital.resolve_rejected(&position_id).await?;
                Ok(false)
            }
            Ok(ack) => {
                self.rt
                    .capital
                    .confirm_active(&position_id, &ack.order_id)
                    .await?;
                self.rt
                    .reconciler
                    .book()
                    .apply_fill(&signal.symbol, signal.side, ack.filled_quantity);
                info!(
                    "[{}] {} {} {} placed ({}), {} reserved",
                    self.rt.account_id, signal.side, signal.quantity, signal.symbol, ack.order_id, amount
                );
                Ok(true)
            }
            Err(e) if e.is_ambiguous_outcome() => {
                // The exchange may hold this order; the capital stays pinned
                // until settlement finds out.
                self.rt.capital.mark_fate_unknown(&position_id).await?;
                warn!(
                    "[{}] order for {} has unknown outcome: {}",
                    self.rt.account_id, signal.symbol, e
                );
                Ok(false)
            }
            Err(e) => {
                self.rt.capital.resolve_rejected(&position_id).await?;
                if e.is_permanent() {
                    return Err(e);
                }
                warn!("[{}] order for {} not placed: {}", self.rt.account_id, signal.symbol, e);
                Ok(false)
            }
        }
    }

    /// Resolve reservations against exchange truth: confirm or free
    /// unresolved submissions, release capital of closed positions.
    async fn settle(&self) -> Result<()> {
        let reservations = self.rt.capital.reservations(self.id()).await?;
        if reservations.is_empty() {
            return Ok(());
        }

        let open_orders = self.rt.gateway.fetch_open_orders_lenient().await?;
        let holdings: HashMap<String, Decimal> = self
            .rt
            .gateway
            .fetch_balances_lenient()
            .await?
            .into_iter()
            .map(|b| {
                let total = b.total();
                (b.asset, total)
            })
            .collect();
        let grace = chrono::Duration::milliseconds(self.config.unknown_grace_ms as i64);

        for r in reservations {
            let held = holdings.get(&r.symbol).copied().unwrap_or_default();
            let resting = open_orders.iter().find(|o| {
                r.client_order_id.as_deref() == Some(o.client_order_id.as_str())
                    || r.order_id.as_deref() == Some(o.order_id.as_str())
            });

            match r.status {
                ReservationStatus::Submitted | ReservationStatus::FateUnknown => {
                    let baseline = r.baseline_quantity.unwrap_or_default();
                    if let Some(order) = resting {
                        info!("[{}] {} found resting as {}", self.rt.account_id, r.position_id, order.order_id);
                        self.rt.capital.confirm_active(&r.position_id, &order.order_id).await?;
                    } else if held > baseline {
                        info!("[{}] {} found filled ({} > {})", self.rt.account_id, r.position_id, held, baseline);
                        let order_id = r.client_order_id.clone().unwrap_or_default();
                        self.rt.capital.confirm_active(&r.position_id, &order_id).await?;
                    } else if Utc::now() - r.updated_at >= grace {
                        info!(
                            "[{}] {} never reached the exchange, freeing {}",
                            self.rt.account_id, r.position_id, r.amount
                        );
                        self.rt.capital.resolve_rejected(&r.position_id).await?;
                    } else {
                        debug!("[{}] {} still unresolved", self.rt.account_id, r.position_id);
                    }
                }
                ReservationStatus::Active if resting.is_none() => {
                    // Back at or below what was held before this buy, or dust
                    let baseline = r.baseline_quantity.unwrap_or_default();
                    if held <= baseline || self.is_dust_holding(&r.symbol, held).await? {
                        debug!("[{}] {} closed, releasing {}", self.rt.account_id, r.symbol, r.amount);
                        self.rt.capital.release(&r.position_id).await?;
                    }
                }
                ReservationStatus::Active => {}
                ReservationStatus::Pending => {
                    // Reserved but never submitted
                    self.rt.capital.release(&r.position_id).await?;
                }
            }
        }

        Ok(())
    }

    /// A holding without an obtainable price is never treated as dust
    async fn is_dust_holding(&self, symbol: &str, held: Decimal) -> Result<bool> {
        if held.is_zero() {
            return Ok(true);
        }
        match self.rt.gateway.fetch_price(symbol).await {
            Ok(price) => Ok(price * held < self.rt.reconciler.config().dust_threshold),
            Err(KestrelError::PriceUnavailable { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
