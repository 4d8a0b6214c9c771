//! Orchestrator — owns the account loops
//!
//! Each account runs as its own tokio task. The orchestrator only spawns,
//! observes and signals them; it is never on the path of an order.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::coordination::{HaltRecord, ShutdownSignal, TradingHalt};
use crate::domain::AccountId;
use crate::error::{KestrelError, Result};

use super::account_loop::{AccountLoop, AccountRuntime};
use super::command::AccountCommand;
use super::config::OrchestratorConfig;
use super::state::AccountStatus;

struct AccountHandle {
    status: Arc<RwLock<AccountStatus>>,
    commands: mpsc::Sender<AccountCommand>,
    stop: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    halt: Arc<TradingHalt>,
    accounts: BTreeMap<AccountId, AccountHandle>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("accounts", &self.account_ids())
            .field("halted", &self.halt.is_halted())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, halt: Arc<TradingHalt>) -> Self {
        Self {
            config,
            halt,
            accounts: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start the loop for one account
    pub fn spawn(&mut self, rt: AccountRuntime) -> Result<()> {
        if self.accounts.contains_key(&rt.account_id) {
            return Err(KestrelError::Validation(format!(
                "account {} already running",
                rt.account_id
            )));
        }

        let account_id = rt.account_id.clone();
        let status = Arc::new(RwLock::new(AccountStatus::new(
            account_id.clone(),
            rt.role,
            rt.gateway.exchange(),
        )));
        let (tx, rx) = mpsc::channel(16);
        let stop = ShutdownSignal::new(format!("account {}", account_id));

        let account_loop = AccountLoop::new(rt, self.config.clone(), status.clone(), rx, stop.token());
        let task = tokio::spawn(account_loop.run());

        self.accounts.insert(
            account_id,
            AccountHandle {
                status,
                commands: tx,
                stop,
                task: Mutex::new(Some(task)),
            },
        );
        Ok(())
    }

    fn handle(&self, account_id: &AccountId) -> Result<&AccountHandle> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| KestrelError::Validation(format!("unknown account {}", account_id)))
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.keys().cloned().collect()
    }

    /// State, last cycle time, last error and counters of one account
    pub async fn status(&self, account_id: &AccountId) -> Option<AccountStatus> {
        let handle = self.accounts.get(account_id)?;
        let status = handle.status.read().await.clone();
        Some(status)
    }

    pub async fn statuses(&self) -> Vec<AccountStatus> {
        let mut statuses = Vec::with_capacity(self.accounts.len());
        for handle in self.accounts.values() {
            statuses.push(handle.status.read().await.clone());
        }
        statuses
    }

    /// Take a paused account back into its cycle
    pub async fn resume(&self, account_id: &AccountId) -> Result<()> {
        self.send(account_id, AccountCommand::Resume).await
    }

    pub async fn pause(&self, account_id: &AccountId, reason: impl Into<String>) -> Result<()> {
        self.send(account_id, AccountCommand::Pause(reason.into())).await
    }

    async fn send(&self, account_id: &AccountId, command: AccountCommand) -> Result<()> {
        self.handle(account_id)?
            .commands
            .send(command)
            .await
            .map_err(|_| KestrelError::Internal(format!("account {} loop has exited", account_id)))
    }

    /// Ask one account loop to stop after its current cycle
    pub fn stop(&self, account_id: &AccountId) -> Result<()> {
        self.handle(account_id)?.stop.request();
        Ok(())
    }

    pub fn halt(&self) -> &Arc<TradingHalt> {
        &self.halt
    }

    /// Operator clearance of a system-wide halt
    pub fn clear_halt(&self, operator: &str) -> Option<HaltRecord> {
        self.halt.clear(operator)
    }

    /// Stop every loop and wait for each to finish its current cycle
    pub async fn shutdown(&self) {
        info!("Stopping {} account loops", self.accounts.len());
        for handle in self.accounts.values() {
            handle.stop.request();
        }

        let mut ids = Vec::new();
        let mut tasks = Vec::new();
        for (account_id, handle) in &self.accounts {
            if let Some(task) = handle.task.lock().await.take() {
                ids.push(account_id);
                tasks.push(task);
            }
        }

        for (account_id, result) in ids.into_iter().zip(join_all(tasks).await) {
            if let Err(e) = result {
                error!("[{}] account loop ended abnormally: {}", account_id, e);
            }
        }

        if let Some(record) = self.halt.record() {
            warn!(
                "Shutdown with trading halt still latched since {}: {}",
                record.triggered_at, record.reason
            );
        }
        info!("All account loops stopped");
    }
}
