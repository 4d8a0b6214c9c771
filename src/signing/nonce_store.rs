//! Durable storage for the nonce ceiling
//!
//! The ceiling is an upper bound on every nonce ever issued. Stores only ever
//! move it forward.

use crate::error::{KestrelError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Last persisted ceiling, if any
    async fn load_ceiling(&self) -> Result<Option<u64>>;

    /// Persist a new ceiling; implementations never lower a stored value
    async fn store_ceiling(&self, ceiling: u64) -> Result<()>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// In-process store. Cloning shares the value, which makes it usable to
/// simulate a restart in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryNonceStore {
    ceiling: std::sync::Arc<Mutex<Option<u64>>>,
    fail_writes: std::sync::Arc<AtomicBool>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (for failure-path tests)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn load_ceiling(&self) -> Result<Option<u64>> {
        let ceiling = self
            .ceiling
            .lock()
            .map_err(|_| KestrelError::NonceStore("memory store poisoned".to_string()))?;
        Ok(*ceiling)
    }

    async fn store_ceiling(&self, ceiling: u64) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KestrelError::NonceStore("write disabled".to_string()));
        }
        let mut current = self
            .ceiling
            .lock()
            .map_err(|_| KestrelError::NonceStore("memory store poisoned".to_string()))?;
        *current = Some(current.map_or(ceiling, |c| c.max(ceiling)));
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CeilingSnapshot {
    ceiling: u64,
    updated_at: DateTime<Utc>,
}

/// JSON snapshot on local disk, replaced atomically via rename
#[derive(Debug, Clone)]
pub struct FileNonceStore {
    path: PathBuf,
}

impl FileNonceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_snapshot(&self) -> Result<Option<CeilingSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl NonceStore for FileNonceStore {
    async fn load_ceiling(&self) -> Result<Option<u64>> {
        Ok(self.read_snapshot().await?.map(|s| s.ceiling))
    }

    async fn store_ceiling(&self, ceiling: u64) -> Result<()> {
        let existing = self.read_snapshot().await?.map(|s| s.ceiling).unwrap_or(0);
        let snapshot = CeilingSnapshot {
            ceiling: ceiling.max(existing),
            updated_at: Utc::now(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec(&snapshot)?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// PostgreSQL-backed store
///
/// Uses a `nonce_state` row per scope; the update keeps the greater of the
/// stored and the offered ceiling, so concurrent processes cannot regress it.
pub struct PostgresNonceStore {
    pool: PgPool,
    scope: String,
}

impl PostgresNonceStore {
    pub async fn connect(url: &str, scope: impl Into<String>) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(2).connect(url).await?;
        let store = Self {
            pool,
            scope: scope.into(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nonce_state (
                scope TEXT PRIMARY KEY,
                ceiling BIGINT NOT NULL,
                last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Nonce state table ready (scope {})", self.scope);
        Ok(())
    }
}

#[async_trait]
impl NonceStore for PostgresNonceStore {
    async fn load_ceiling(&self) -> Result<Option<u64>> {
        let ceiling: Option<i64> =
            sqlx::query_scalar("SELECT ceiling FROM nonce_state WHERE scope = $1")
                .bind(&self.scope)
                .fetch_optional(&self.pool)
                .await?;

        Ok(ceiling.map(|c| c.max(0) as u64))
    }

    async fn store_ceiling(&self, ceiling: u64) -> Result<()> {
        let value = i64::try_from(ceiling).map_err(|_| {
            KestrelError::NonceStore(format!("ceiling {} exceeds BIGINT", ceiling))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO nonce_state (scope, ceiling, last_updated)
            VALUES ($1, $2, NOW())
            ON CONFLICT (scope) DO UPDATE
            SET ceiling = GREATEST(nonce_state.ceiling, EXCLUDED.ceiling),
                last_updated = NOW()
            "#,
        )
        .bind(&self.scope)
        .bind(value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Nonce ceiling upsert affected no rows (scope {})", self.scope);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("postgres scope {}", self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_never_lowers() {
        let store = MemoryNonceStore::new();
        assert_eq!(store.load_ceiling().await.unwrap(), None);

        store.store_ceiling(50).await.unwrap();
        store.store_ceiling(20).await.unwrap();
        assert_eq!(store.load_ceiling().await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNonceStore::new(dir.path().join("state").join("nonce.json"));

        assert_eq!(store.load_ceiling().await.unwrap(), None);
        store.store_ceiling(1_700_000_000_000_000_000).await.unwrap();
        store.store_ceiling(5).await.unwrap();

        let reopened = FileNonceStore::new(dir.path().join("state").join("nonce.json"));
        assert_eq!(
            reopened.load_ceiling().await.unwrap(),
            Some(1_700_000_000_000_000_000)
        );
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonce.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = FileNonceStore::new(&path);
        assert!(store.load_ceiling().await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_postgres_store_monotonic() {
        let store = PostgresNonceStore::connect("postgresql://localhost/kestrel_test", "test")
            .await
            .unwrap();
        store.store_ceiling(1_000).await.unwrap();
        store.store_ceiling(10).await.unwrap();
        assert!(store.load_ceiling().await.unwrap().unwrap() >= 1_000);
    }
}
