//! Key-value storage backed by libSQL (Turso).
//!
//! Remote Turso/libSQL databases are used when `TURSO_DATABASE_URL` /
//! `LIBSQL_DATABASE_URL` (+ token) are set; otherwise a local file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libsql::{Builder, Database, params};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::services::retry::RetryConfig;

use super::{KvStore, StoreError};

const KV_DB_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbMode {
    Remote,
    Local,
}

#[derive(Clone)]
pub struct LibsqlKvStore {
    inner: Arc<LibsqlKvStoreInner>,
}

struct LibsqlKvStoreInner {
    db: Database,
    db_mode: DbMode,
    /// Serialize writes for local file databases to reduce SQLITE_BUSY contention.
    write_gate: Option<Arc<Semaphore>>,
}

const DB_LOCKED_RETRY: RetryConfig = RetryConfig {
    max_attempts: 5,
    base_delay: Duration::from_millis(25),
    max_delay: Duration::from_millis(400),
};

async fn retry_db_locked<T, Fut, F>(op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    DB_LOCKED_RETRY
        .run(op, |err| matches!(err, StoreError::Locked { .. }))
        .await
}

fn remote_target() -> Option<(String, String)> {
    let url = std::env::var("TURSO_DATABASE_URL")
        .or_else(|_| std::env::var("LIBSQL_DATABASE_URL"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())?;

    let token = std::env::var("TURSO_AUTH_TOKEN")
        .or_else(|_| std::env::var("LIBSQL_AUTH_TOKEN"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())?;

    Some((url, token))
}

impl LibsqlKvStore {
    /// Remote database when configured, else the local file at `local_path`.
    pub async fn from_env(local_path: &Path) -> Result<Self, StoreError> {
        if let Some((url, token)) = remote_target() {
            log::info!("KV store: using remote Turso/libSQL");
            let db = Builder::new_remote(url, token).build().await?;
            return Self::with_database(db, DbMode::Remote).await;
        }

        log::info!(
            "KV store: TURSO env missing, using local file {}",
            local_path.display()
        );
        Self::open_local(local_path).await
    }

    pub async fn open_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::internal(format!("Failed to create data directory: {e}"))
            })?;
        }
        let db = Builder::new_local(path_string(path)).build().await?;
        Self::with_database(db, DbMode::Local).await
    }

    async fn with_database(db: Database, db_mode: DbMode) -> Result<Self, StoreError> {
        let write_gate = match db_mode {
            DbMode::Remote => None,
            DbMode::Local => Some(Arc::new(Semaphore::new(1))),
        };
        let store = Self {
            inner: Arc::new(LibsqlKvStoreInner {
                db,
                db_mode,
                write_gate,
            }),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn connect(&self) -> Result<libsql::Connection, StoreError> {
        let conn = self.inner.db.connect()?;
        // Best-effort pragmas; remote mode may ignore them.
        if self.inner.db_mode == DbMode::Local {
            let _ = conn.busy_timeout(KV_DB_BUSY_TIMEOUT);
            let _ = conn.query("PRAGMA journal_mode = WAL;", ()).await;
            let _ = conn.query("PRAGMA synchronous = NORMAL;", ()).await;
        }
        Ok(conn)
    }

    async fn write_permit(&self) -> Result<Option<OwnedSemaphorePermit>, StoreError> {
        let Some(gate) = self.inner.write_gate.as_ref() else {
            return Ok(None);
        };
        gate.clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| StoreError::internal("KV store write gate closed"))
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.connect().await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (\n  key TEXT PRIMARY KEY NOT NULL,\n  value TEXT NOT NULL,\n  updated_at_ms INTEGER NOT NULL DEFAULT 0\n);",
            (),
        )
        .await?;
        Ok(())
    }
}

fn path_string(path: &Path) -> String {
    PathBuf::from(path).to_string_lossy().to_string()
}

#[async_trait]
impl KvStore for LibsqlKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT value FROM kv WHERE key = ?1 LIMIT 1;", params![key])
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let value: String = row.get(0)?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _write = self.write_permit().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        retry_db_locked(|| async {
            let conn = self.connect().await?;
            conn.execute(
                "INSERT INTO kv (key, value, updated_at_ms) VALUES (?1, ?2, ?3)\n  ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms;",
                params![key, value, now_ms],
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let _write = self.write_permit().await?;
        retry_db_locked(|| async {
            let conn = self.connect().await?;
            let affected = conn
                .execute("DELETE FROM kv WHERE key = ?1;", params![key])
                .await?;
            Ok(affected > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect().await?;
        let mut rows = conn.query("SELECT key FROM kv ORDER BY key ASC;", ()).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row.get::<String>(0)?);
        }
        Ok(out)
    }
}
