//! The `Store` handle: one `SqlitePool`, WAL + busy-timeout + foreign-key
//! pragmas, embedded migrations, and the slow-query log.

use std::path::Path;
use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::warn;

use crate::crypto::AeadCipher;
use crate::error::{Result, StoreError};

/// Queries slower than this are logged at `warn` with their correlation
/// id, per spec.md §4.1.
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(100);

/// Default busy timeout applied to every connection in the pool.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Transactional, WAL-mode SQLite persistence for networks, peers,
/// bridges, snapshots, and the auxiliary tables the core merely owns the
/// schema for.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) cipher: Option<AeadCipher>,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `path`, apply
    /// embedded migrations, and return a ready `Store`. `encryption_key`,
    /// when present, is used to AEAD-encrypt private key columns at
    /// rest; when absent, keys are stored and returned as plain base64.
    pub async fn open(path: &Path, encryption_key: Option<[u8; 32]>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(StoreError::from)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Self {
            pool,
            cipher: encryption_key.map(AeadCipher::new),
        })
    }

    /// Begin a transaction. Callers drive it with `StoreTx`'s own
    /// entity methods, then call `commit` or `rollback` explicitly —
    /// dropping it without either rolls back, matching `sqlx`'s own
    /// `Transaction` semantics.
    pub async fn begin(&self) -> Result<StoreTx<'_>> {
        let tx = self.pool.begin().await.map_err(StoreError::from)?;
        Ok(StoreTx {
            tx,
            cipher: self.cipher.as_ref(),
        })
    }

    /// Log a slow query if `elapsed` exceeds the threshold, tagged with
    /// the caller-supplied correlation id.
    pub(crate) fn log_if_slow(operation: &str, correlation_id: &str, elapsed: Duration) {
        if elapsed > SLOW_QUERY_THRESHOLD {
            warn!(
                operation,
                correlation_id,
                elapsed_ms = elapsed.as_millis(),
                "slow store query"
            );
        }
    }

    /// Time an async operation against the pool and log it if slow.
    pub(crate) async fn timed<T, F>(&self, operation: &'static str, correlation_id: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        Self::log_if_slow(operation, correlation_id, start.elapsed());
        result
    }
}

/// An open transaction over the store. Entity methods mirror `Store`'s
/// own but run against the transaction's connection rather than the
/// pool, so a caller can compose several writes atomically before
/// `commit`.
pub struct StoreTx<'c> {
    pub(crate) tx: Transaction<'c, Sqlite>,
    pub(crate) cipher: Option<&'c AeadCipher>,
}

impl<'c> StoreTx<'c> {
    /// Commit all writes made through this transaction.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(StoreError::from)
    }

    /// Discard all writes made through this transaction.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(StoreError::from)
    }
}

/// Construction helpers for other crates' tests. Gated behind the
/// `test-util` feature (always on under `cfg(test)` for this crate's
/// own suite) rather than being part of the normal public surface.
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::*;
    use tempfile::NamedTempFile;

    /// Open a fresh `Store` backed by a temp file, returning the file
    /// alongside it so it isn't deleted until the caller drops it.
    pub async fn temp_store() -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().expect("create temp db file");
        let store = Store::open(file.path(), None).await.expect("open store");
        (store, file)
    }

    pub async fn temp_store_encrypted(key: [u8; 32]) -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().expect("create temp db file");
        let store = Store::open(file.path(), Some(key)).await.expect("open store");
        (store, file)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_store;

    #[tokio::test]
    async fn open_runs_migrations_and_is_idempotent() {
        let (store, file) = temp_store().await;
        drop(store);
        // Re-opening the same file must not fail even though migrations
        // already ran.
        let reopened = super::Store::open(file.path(), None).await;
        assert!(reopened.is_ok());
    }

    #[tokio::test]
    async fn transaction_commit_and_rollback_both_succeed() {
        let (store, _file) = temp_store().await;
        let tx = store.begin().await.expect("begin");
        tx.commit().await.expect("commit");

        let tx = store.begin().await.expect("begin");
        tx.rollback().await.expect("rollback");
    }
}
