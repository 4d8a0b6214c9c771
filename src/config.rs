use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::coordination::CircuitBreakerConfig;
use crate::coordinator::OrchestratorConfig;
use crate::domain::AccountRole;
use crate::signing::NonceConfig;
use crate::strategy::{CapConfig, CapitalConfig};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cap: CapConfig,
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// One trading account. Credentials are never stored in config files; only
/// the names of the environment variables holding them.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default = "default_role")]
    pub role: AccountRole,
    /// Exchange name; accounts with the same name share one breaker and serializer
    pub exchange: String,
    pub api_key_env: String,
    pub api_secret_env: String,
    /// Starting quote balance when running against the paper exchange
    #[serde(default = "default_paper_balance")]
    pub paper_quote_balance: Decimal,
}

fn default_role() -> AccountRole {
    AccountRole::User
}

fn default_paper_balance() -> Decimal {
    Decimal::from(10_000)
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rotated log files here
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("KESTREL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // KESTREL__CIRCUIT_BREAKER__FAILURE_THRESHOLD=3, etc.
            .add_source(
                Environment::with_prefix("KESTREL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.accounts.is_empty() {
            errors.push("at least one account must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                errors.push("account id must not be empty".to_string());
            }
            if !seen.insert(account.id.as_str()) {
                errors.push(format!("duplicate account id: {}", account.id));
            }
            if account.exchange.trim().is_empty() {
                errors.push(format!("account {}: exchange must not be empty", account.id));
            }
            if account.paper_quote_balance < Decimal::ZERO {
                errors.push(format!("account {}: paper_quote_balance must not be negative", account.id));
            }
        }

        if self.cap.max_positions == 0 {
            errors.push("cap.max_positions must be at least 1".to_string());
        }
        if self.cap.max_cycles == 0 {
            errors.push("cap.max_cycles must be at least 1".to_string());
        }
        if self.cap.warning_threshold_pct >= self.cap.critical_threshold_pct {
            errors.push("cap.warning_threshold_pct must be below cap.critical_threshold_pct".to_string());
        }

        let buffer = self.capital.safety_buffer_pct;
        if buffer < Decimal::ZERO || buffer >= Decimal::ONE {
            errors.push("capital.safety_buffer_pct must be in [0, 1)".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.half_open_success_threshold == 0 {
            errors.push("circuit_breaker.half_open_success_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.call_timeout_ms == 0 {
            errors.push("circuit_breaker.call_timeout_ms must be positive".to_string());
        }
        if self.circuit_breaker.base_backoff_ms > self.circuit_breaker.max_backoff_ms {
            errors.push("circuit_breaker.base_backoff_ms exceeds max_backoff_ms".to_string());
        }

        if self.orchestrator.cycle_interval_ms == 0 {
            errors.push("orchestrator.cycle_interval_ms must be positive".to_string());
        }

        if self.nonce.persist_every == 0 {
            errors.push("nonce.persist_every must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) {
        let mut file = std::fs::File::create(dir.join("default.toml")).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn test_load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[cap]
max_positions = 5

[[accounts]]
id = "master"
role = "master"
exchange = "paper"
api_key_env = "MASTER_KEY"
api_secret_env = "MASTER_SECRET"
"#,
        );

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.cap.max_positions, 5);
        assert_eq!(config.cap.max_cycles, 3);
        assert_eq!(config.capital.safety_buffer_pct, dec!(0.10));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].role, AccountRole::Master);
        assert_eq!(config.accounts[0].paper_quote_balance, dec!(10000));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[capital]
safety_buffer_pct = 1.5

[[accounts]]
id = "a"
exchange = "paper"
api_key_env = "K"
api_secret_env = "S"

[[accounts]]
id = "a"
exchange = ""
api_key_env = "K"
api_secret_env = "S"
"#,
        );

        let config = AppConfig::load_from(dir.path()).unwrap();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate account id")));
        assert!(errors.iter().any(|e| e.contains("exchange must not be empty")));
        assert!(errors.iter().any(|e| e.contains("safety_buffer_pct")));
    }

    #[test]
    fn test_no_accounts_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "");
        let config = AppConfig::load_from(dir.path()).unwrap();
        assert!(config.validate().is_err());
    }
}
