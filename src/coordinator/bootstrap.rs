//! Bootstrap — wires the orchestrator from config
//!
//! Builds the shared pieces once (nonce authority, per-exchange guards,
//! trading halt, capital ledger) and hands each account its own runtime.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{AccountConfig, AppConfig};
use crate::coordination::TradingHalt;
use crate::domain::{Account, AccountId, Credentials};
use crate::error::Result;
use crate::exchange::{AccountGateway, ExchangeClient, ExchangeGuards};
use crate::signing::{
    FileNonceStore, MemoryNonceStore, NonceAuthority, NonceConfig, NonceStore, PostgresNonceStore,
    SystemClock,
};
use crate::strategy::{CapitalReservationManager, PositionReconciler, SignalSource};

use super::account_loop::AccountRuntime;
use super::coordinator::Orchestrator;

/// Builds the exchange connector for one account
pub type ClientFactory =
    dyn Fn(&AccountConfig, &Account) -> Result<Arc<dyn ExchangeClient>> + Send + Sync;

/// Open the process-wide nonce authority on the configured store.
///
/// A file path wins over a database URL. With neither, the floor lives in
/// memory only and a restart relies on the clock alone.
pub async fn open_nonce_authority(config: &NonceConfig) -> Result<Arc<NonceAuthority>> {
    let store: Arc<dyn NonceStore> = if let Some(path) = &config.store_path {
        Arc::new(FileNonceStore::new(path))
    } else if let Some(url) = &config.database_url {
        Arc::new(PostgresNonceStore::connect(url, config.scope.clone()).await?)
    } else {
        warn!("No nonce store configured; the nonce floor will not survive a restart");
        Arc::new(MemoryNonceStore::new())
    };

    let authority = NonceAuthority::open(config.clone(), store, Arc::new(SystemClock)).await?;
    Ok(Arc::new(authority))
}

fn account_credentials(account: &AccountConfig, paper: bool) -> Result<Credentials> {
    match Credentials::from_env(&account.api_key_env, &account.api_secret_env) {
        Ok(credentials) => Ok(credentials),
        Err(e) if paper => {
            debug!("[{}] {}; using paper credentials", account.id, e);
            Ok(Credentials::new("paper", "paper"))
        }
        Err(e) => Err(e),
    }
}

/// Build an orchestrator with one spawned loop per configured account.
///
/// Must be called inside a tokio runtime.
pub async fn build_orchestrator(
    config: &AppConfig,
    factory: &ClientFactory,
    signals: Arc<dyn SignalSource>,
    paper: bool,
) -> Result<Orchestrator> {
    let nonces = open_nonce_authority(&config.nonce).await?;
    let halt = Arc::new(TradingHalt::new());
    let capital = Arc::new(CapitalReservationManager::new(config.capital.clone()));

    let mut guards: HashMap<String, Arc<ExchangeGuards>> = HashMap::new();
    let mut orchestrator = Orchestrator::new(config.orchestrator.clone(), halt.clone());

    for account_config in &config.accounts {
        let account = Account {
            id: AccountId::new(account_config.id.clone()),
            role: account_config.role,
            exchange: account_config.exchange.clone(),
            credentials: account_credentials(account_config, paper)?,
        };

        let exchange_guards = guards
            .entry(account.exchange.clone())
            .or_insert_with(|| {
                Arc::new(ExchangeGuards::new(
                    account.exchange.clone(),
                    config.circuit_breaker.clone(),
                ))
            })
            .clone();

        let client = factory(account_config, &account)?;
        let gateway = AccountGateway::new(account.id.clone(), client, exchange_guards, nonces.clone());
        let reconciler = PositionReconciler::new(gateway.clone(), config.cap.clone(), halt.clone());

        info!(
            "[{}] {} account on {} (key {})",
            account.id,
            account.role,
            account.exchange,
            account.credentials.key_hint()
        );

        orchestrator.spawn(AccountRuntime {
            account_id: account.id.clone(),
            role: account.role,
            gateway,
            reconciler: Arc::new(reconciler),
            capital: capital.clone(),
            signals: signals.clone(),
            halt: halt.clone(),
        })?;
    }

    info!(
        "Orchestrator running {} accounts across {} exchanges",
        config.accounts.len(),
        guards.len()
    );
    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;
    use crate::exchange::PaperExchange;
    use crate::strategy::IdleSignalSource;
    use rust_decimal_macros::dec;

    fn account(id: &str, exchange: &str) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            role: crate::domain::AccountRole::User,
            exchange: exchange.to_string(),
            api_key_env: format!("KESTREL_TEST_{}_KEY_UNSET", id.to_uppercase()),
            api_secret_env: format!("KESTREL_TEST_{}_SECRET_UNSET", id.to_uppercase()),
            paper_quote_balance: dec!(500),
        }
    }

    fn app_config(accounts: Vec<AccountConfig>) -> AppConfig {
        AppConfig {
            nonce: NonceConfig {
                warmup_secs: 0,
                ..Default::default()
            },
            circuit_breaker: Default::default(),
            cap: Default::default(),
            capital: Default::default(),
            orchestrator: Default::default(),
            logging: LoggingConfig::default(),
            accounts,
        }
    }

    fn paper_factory(cfg: &AccountConfig, account: &Account) -> Result<Arc<dyn ExchangeClient>> {
        Ok(Arc::new(
            PaperExchange::new(account.exchange.clone()).with_balance("USD", cfg.paper_quote_balance),
        ))
    }

    #[tokio::test]
    async fn test_paper_mode_spawns_every_account() {
        let config = app_config(vec![account("master", "paper"), account("alice", "paper")]);
        let orchestrator = build_orchestrator(&config, &paper_factory, Arc::new(IdleSignalSource), true)
            .await
            .unwrap();

        let ids = orchestrator.account_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&AccountId::from("alice")));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_mode_requires_credentials() {
        let config = app_config(vec![account("bob", "paper")]);
        match build_orchestrator(&config, &paper_factory, Arc::new(IdleSignalSource), false).await {
            Ok(orchestrator) => panic!("started without credentials: {:?}", orchestrator),
            Err(err) => assert!(err.is_permanent()),
        }
    }

    #[tokio::test]
    async fn test_file_store_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonce.json");
        let config = NonceConfig {
            store_path: Some(path.to_string_lossy().into_owned()),
            database_url: Some("postgres://unused".to_string()),
            warmup_secs: 0,
            ..Default::default()
        };

        let authority = open_nonce_authority(&config).await.unwrap();
        let first = authority.next().await.unwrap();
        assert!(first.value() > 0);
        assert!(path.exists());
    }
}
