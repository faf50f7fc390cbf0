//! Daemon configuration: defaults layered under an optional TOML file,
//! itself layered under CLI flags and environment variables. Grounded
//! on `clawnode::config::NodeConfig`'s serde-default field shape, but
//! loaded through the `config` crate's layered `Figment`-style builder
//! instead of a single `std::fs::read_to_string` + `serde_json::from_str`
//! call, since wgpilotd has no companion `save()`/setup wizard step that
//! would need the file to round-trip byte-for-byte.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use wgpilot_core::monitor::{DEFAULT_COMPACTION_INTERVAL, DEFAULT_POLL_INTERVAL, DEFAULT_RETENTION};

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base64-encoded 32-byte AEAD key for encrypting private keys at
    /// rest. Absent means private keys are stored as plain base64
    /// (spec.md §4.1).
    pub encryption_key: Option<String>,
    /// Seconds between Monitor poll ticks (spec.md §4.7 default 30s).
    pub poll_interval_secs: u64,
    /// Seconds between snapshot compaction ticks (default 24h).
    pub compaction_interval_secs: u64,
    /// Seconds a snapshot survives before compaction deletes it
    /// (default 30d).
    pub retention_secs: u64,
    /// Enable verbose (debug-level) logging.
    pub verbose: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/wgpilot/wgpilot.db"),
            encryption_key: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            compaction_interval_secs: DEFAULT_COMPACTION_INTERVAL.as_secs(),
            retention_secs: DEFAULT_RETENTION.as_secs(),
            verbose: false,
        }
    }
}

impl DaemonConfig {
    /// Layer defaults, then an optional TOML file, then environment
    /// variables prefixed `WGPILOTD_` (e.g. `WGPILOTD_DB_PATH`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but fails to parse, or a
    /// field fails to deserialize into its target type.
    pub fn load(file: Option<&PathBuf>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        // Fields absent from both the file and the environment keep
        // their `Default::default()` value via the container-level
        // `#[serde(default)]` attribute above, so no `set_default`
        // calls are needed here.
        builder
            .add_source(config::Environment::with_prefix("WGPILOTD"))
            .build()?
            .try_deserialize()
    }

    /// Decode [`Self::encryption_key`] into the raw 32-byte key the
    /// Store's AEAD cipher expects, if one was configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not valid base64 or does not
    /// decode to exactly 32 bytes.
    pub fn decode_encryption_key(&self) -> Result<Option<[u8; 32]>, ConfigKeyError> {
        let Some(raw) = &self.encryption_key else {
            return Ok(None);
        };
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|_| ConfigKeyError::InvalidBase64)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| ConfigKeyError::WrongLength)?;
        Ok(Some(key))
    }

    /// [`Self::poll_interval_secs`] as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// [`Self::compaction_interval_secs`] as a [`Duration`].
    #[must_use]
    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }

    /// [`Self::retention_secs`] as a [`Duration`].
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Errors decoding [`DaemonConfig::encryption_key`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigKeyError {
    /// The configured value was not valid base64.
    #[error("encryption_key is not valid base64")]
    InvalidBase64,
    /// The decoded bytes were not exactly 32 bytes long.
    #[error("encryption_key must decode to exactly 32 bytes")]
    WrongLength,
}
