use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KestrelError, Result};

/// Account identifier (e.g. "master", "user-7")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Master and user accounts are peers; the role is informational
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Master,
    User,
}

impl std::fmt::Display for AccountRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountRole::Master => write!(f, "master"),
            AccountRole::User => write!(f, "user"),
        }
    }
}

/// API credentials, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read credentials from the named environment variables
    pub fn from_env(key_var: &str, secret_var: &str) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .map_err(|_| KestrelError::Auth(format!("{} is not set", key_var)))?;
        let api_secret = std::env::var(secret_var)
            .map_err(|_| KestrelError::Auth(format!("{} is not set", secret_var)))?;

        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(KestrelError::Auth(format!(
                "{} / {} must not be empty",
                key_var, secret_var
            )));
        }

        Ok(Self::new(api_key, api_secret))
    }

    /// Key prefix safe to print in logs
    pub fn key_hint(&self) -> String {
        let prefix: String = self.api_key.chars().take(4).collect();
        format!("{}…", prefix)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.key_hint())
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// A trading account as known to the orchestrator
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub role: AccountRole,
    pub exchange: String,
    pub credentials: Credentials,
}
