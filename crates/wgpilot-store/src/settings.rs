//! Flat key/value settings, used by the setup state machine to persist
//! its current step and by the Orchestrator for other small singleton
//! values that don't warrant their own table.

use sqlx::{Executor, Sqlite};

use crate::error::{Result, StoreError};
use crate::store::{Store, StoreTx};

pub(crate) async fn get<'e, E>(executor: E, key: &str) -> Result<Option<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await
        .map_err(StoreError::from)?;
    Ok(row.map(|(value,)| value))
}

pub(crate) async fn set<'e, E>(executor: E, key: &str, value: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await
    .map_err(StoreError::from)?;
    Ok(())
}

pub(crate) async fn delete<'e, E>(executor: E, key: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(executor)
        .await
        .map_err(StoreError::from)?;
    Ok(result.rows_affected() > 0)
}

impl Store {
    /// Read a setting by key. `Ok(None)` means it was never set.
    pub async fn get_setting(&self, key: &str, correlation_id: &str) -> Result<Option<String>> {
        self.timed("get_setting", correlation_id, get(&self.pool, key)).await
    }

    /// Upsert a setting.
    pub async fn set_setting(&self, key: &str, value: &str, correlation_id: &str) -> Result<()> {
        self.timed("set_setting", correlation_id, set(&self.pool, key, value)).await
    }

    /// Remove a setting. Returns whether a row existed.
    pub async fn delete_setting(&self, key: &str, correlation_id: &str) -> Result<bool> {
        self.timed("delete_setting", correlation_id, delete(&self.pool, key)).await
    }
}

impl<'c> StoreTx<'c> {
    /// Transactional variant of [`Store::get_setting`], used by the
    /// setup state machine to read-then-advance its step atomically.
    pub async fn get_setting(&mut self, key: &str) -> Result<Option<String>> {
        get(&mut *self.tx, key).await
    }

    /// Transactional variant of [`Store::set_setting`].
    pub async fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        set(&mut *self.tx, key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn get_missing_setting_is_ok_none() {
        let (store, _file) = temp_store().await;
        assert!(store.get_setting("setup.step", "test").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (store, _file) = temp_store().await;
        store.set_setting("setup.step", "s2", "test").await.expect("set");
        let value = store.get_setting("setup.step", "test").await.expect("get");
        assert_eq!(value.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn set_again_overwrites() {
        let (store, _file) = temp_store().await;
        store.set_setting("setup.step", "s2", "test").await.expect("set");
        store.set_setting("setup.step", "s3", "test").await.expect("set");
        let value = store.get_setting("setup.step", "test").await.expect("get");
        assert_eq!(value.as_deref(), Some("s3"));
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (store, _file) = temp_store().await;
        store.set_setting("setup.step", "s2", "test").await.expect("set");
        assert!(store.delete_setting("setup.step", "test").await.expect("delete"));
        assert!(store.get_setting("setup.step", "test").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn transaction_read_then_write_is_visible_after_commit() {
        let (store, _file) = temp_store().await;
        let mut tx = store.begin().await.expect("begin");
        assert!(tx.get_setting("setup.step").await.expect("get").is_none());
        tx.set_setting("setup.step", "s1").await.expect("set");
        tx.commit().await.expect("commit");

        let value = store.get_setting("setup.step", "test").await.expect("get");
        assert_eq!(value.as_deref(), Some("s1"));
    }
}
