//! Optional local persistence for outbound messages
//!
//! While the broker is unreachable, relay publishes are buffered in an
//! embedded sled database instead of the in-memory request queue. Rows are
//! replayed in insertion order after the next CONNACK.

pub mod offline_store;

pub use offline_store::{OfflineStore, StoredMessage};

use crate::config::{PersistenceTuning, ProtocolVersion};
use std::path::PathBuf;
use thiserror::Error;

/// Storage limits and location
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceConfig {
    pub dir: PathBuf,
    pub db_name: String,
    /// Rows kept on disk; the oldest are dropped past this
    pub max_rows: usize,
    /// Rows buffered in memory before a disk write
    pub flush_threshold: usize,
    pub version: ProtocolVersion,
}

impl PersistenceConfig {
    pub fn from_tuning(tuning: &PersistenceTuning, version: ProtocolVersion) -> Self {
        Self {
            dir: tuning.dir.clone(),
            db_name: tuning.db_name.clone(),
            max_rows: tuning.max_rows,
            flush_threshold: tuning.flush_threshold,
            version,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join(&self.db_name)
    }

    /// One tree per protocol version so v3.1.1 and v5 rows never mix
    pub fn tree_name(&self) -> String {
        format!("mqtt_v{}", self.version.code())
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self::from_tuning(&PersistenceTuning::default(), ProtocolVersion::default())
    }
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Cannot create persistence directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_builtin_constants() {
        let config = PersistenceConfig::default();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/mqtt_client.db"));
        assert_eq!(config.max_rows, 500);
        assert_eq!(config.flush_threshold, 50);
        assert_eq!(config.tree_name(), "mqtt_v4");
    }

    #[test]
    fn test_tree_name_per_version() {
        let config = PersistenceConfig::from_tuning(&PersistenceTuning::default(), ProtocolVersion::V5);
        assert_eq!(config.tree_name(), "mqtt_v5");
    }
}
