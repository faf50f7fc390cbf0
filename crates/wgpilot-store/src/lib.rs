//! Transactional SQLite persistence for wgpilot: networks, peers,
//! bridges, peer counter snapshots, flat settings, and users. One
//! `Store` handle owns a pooled `SqlitePool` in WAL mode with embedded
//! migrations; AEAD-at-rest encryption of private key material is
//! applied transparently at the column boundary when an encryption key
//! is configured.

mod bridges;
pub mod crypto;
pub mod error;
mod networks;
mod peers;
mod settings;
mod snapshots;
mod store;
pub mod types;
mod users;

pub use error::{Result, StoreError};
pub use store::{Store, StoreTx};
#[cfg(any(test, feature = "test-util"))]
pub use store::test_support;
pub use users::{NewUser, User};
