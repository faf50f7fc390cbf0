//! Stable error taxonomy for the store.

/// Errors produced by store operations.
///
/// Missing rows are *not* represented here — every lookup method returns
/// `Ok(None)` for a miss, matching the "distinguished nil result" language
/// in spec.md §4.1. Only genuine failures reach this type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint was violated (duplicate interface name, listen
    /// port, or bridge pair).
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    /// A foreign key reference pointed at a row that does not exist.
    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    /// The underlying `sqlx` driver returned an error not covered above.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A value stored as encrypted ciphertext failed to decrypt (wrong
    /// key, or corrupted column).
    #[error("failed to decrypt stored key material: {0}")]
    Decryption(String),

    /// A value failed to encode/decode at the storage boundary (e.g. an
    /// unrecognized `mode`/`role`/`direction` string read back from a
    /// column).
    #[error("invalid stored value for {field}: {value}")]
    InvalidStoredValue {
        /// The column or logical field name.
        field: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
}

impl StoreError {
    /// Classify a raw `sqlx::Error` into a `Conflict`/`ForeignKey`
    /// `StoreError` when it represents a constraint violation, otherwise
    /// wrap it unchanged. Call this at every write path so the
    /// Orchestrator can map conflicts to its own closed error codes
    /// without inspecting driver-specific error text itself.
    #[must_use]
    pub fn from_write(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message().to_string();
            if let Some(code) = db_err.code() {
                // SQLite: 1555/2067 = UNIQUE, 787 = FOREIGN KEY constraint
                // failed (primary/extended result codes respectively).
                if code == "1555" || code == "2067" || message.contains("UNIQUE constraint") {
                    return Self::Conflict(message);
                }
                if code == "787" || message.contains("FOREIGN KEY constraint") {
                    return Self::ForeignKey(message);
                }
            }
        }
        Self::Database(err)
    }

    /// Stable error code from the closed taxonomy, where this error kind
    /// maps directly onto one. Conflicts are ambiguous at this layer
    /// (duplicate interface vs. port vs. bridge pair all collide into
    /// the same SQLite error) — the Orchestrator disambiguates using the
    /// operation it was attempting, not this code alone.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "network-already-exists",
            Self::ForeignKey(_) | Self::Database(_) | Self::Decryption(_) | Self::InvalidStoredValue { .. } => {
                "internal-error"
            }
        }
    }
}

/// Convenience result alias for this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
