//! Minimal user persistence. Password hashing and session/JWT handling
//! live at the HTTP boundary — this module only stores the row.

use sqlx::{Executor, Sqlite};

use crate::error::{Result, StoreError};
use crate::store::{Store, StoreTx};

/// A stored user row. `password_hash` is whatever the caller already
/// hashed it to (bcrypt/argon2, chosen at the HTTP layer) — the store
/// never hashes or verifies passwords itself.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    /// Primary key.
    pub id: i64,
    /// Unique login name.
    pub username: String,
    /// Pre-hashed password.
    pub password_hash: String,
    /// Role string, e.g. `"admin"`.
    pub role: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

/// Fields needed to create a new `User` row.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// See [`User::username`].
    pub username: String,
    /// See [`User::password_hash`].
    pub password_hash: String,
    /// See [`User::role`].
    pub role: String,
}

pub(crate) async fn insert<'e, E>(executor: E, new: &NewUser, now: i64) -> Result<User>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, User>(
        "INSERT INTO users (username, password_hash, role, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(&new.username)
    .bind(&new.password_hash)
    .bind(&new.role)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await
    .map_err(StoreError::from_write)
}

pub(crate) async fn get_by_username<'e, E>(executor: E, username: &str) -> Result<Option<User>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(executor)
        .await
        .map_err(StoreError::from)
}

pub(crate) async fn count<'e, E>(executor: E) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(executor)
        .await
        .map_err(StoreError::from)?;
    Ok(n)
}

impl Store {
    /// Create a user. A duplicate username surfaces as
    /// `StoreError::Conflict`.
    pub async fn create_user(&self, new: &NewUser, now: i64, correlation_id: &str) -> Result<User> {
        self.timed("create_user", correlation_id, insert(&self.pool, new, now)).await
    }

    /// Look up a user by login name.
    pub async fn get_user_by_username(&self, username: &str, correlation_id: &str) -> Result<Option<User>> {
        self.timed(
            "get_user_by_username",
            correlation_id,
            get_by_username(&self.pool, username),
        )
        .await
    }

    /// How many users exist. The setup state machine uses this to tell
    /// S0 (no admin yet) from S1+ (admin already created).
    pub async fn user_count(&self, correlation_id: &str) -> Result<i64> {
        self.timed("user_count", correlation_id, count(&self.pool)).await
    }
}

impl<'c> StoreTx<'c> {
    /// Transactional variant of [`Store::create_user`], used by the
    /// setup state machine's non-idempotent first step so the OTP
    /// consumption and admin creation commit atomically.
    pub async fn create_user(&mut self, new: &NewUser, now: i64) -> Result<User> {
        insert(&mut *self.tx, new, now).await
    }

    /// Transactional variant of [`Store::user_count`].
    pub async fn user_count(&mut self) -> Result<i64> {
        count(&mut *self.tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    fn sample(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            password_hash: "$argon2id$fake".to_string(),
            role: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (store, _file) = temp_store().await;
        let created = store.create_user(&sample("admin"), 1000, "test").await.expect("create");
        let fetched = store
            .get_user_by_username("admin", "test")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.role, "admin");
    }

    #[tokio::test]
    async fn duplicate_username_is_conflict() {
        let (store, _file) = temp_store().await;
        store.create_user(&sample("admin"), 1000, "test").await.expect("first create");
        let err = store.create_user(&sample("admin"), 1000, "test").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn count_reflects_created_users() {
        let (store, _file) = temp_store().await;
        assert_eq!(store.user_count("test").await.expect("count"), 0);
        store.create_user(&sample("admin"), 1000, "test").await.expect("create");
        assert_eq!(store.user_count("test").await.expect("count"), 1);
    }
}
