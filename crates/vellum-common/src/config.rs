//! Configuration structures for Vellum.

use serde::{Deserialize, Serialize};

/// Configuration for a record store instance.
///
/// All configuration is supplied programmatically by the embedding layer;
/// there are no environment variables or config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Enable the write-ahead transaction log.
    ///
    /// When disabled, dirty blocks are synced directly to the data file on
    /// commit and crash recovery guarantees do not apply. Intended for
    /// bulk-load scenarios.
    pub transactions_enabled: bool,
    /// Number of committed transactions held in the log before they are
    /// synchronized into the data file and the log is truncated.
    pub txns_before_sync: usize,
    /// Enable fsync on log and data file writes.
    pub fsync_enabled: bool,
    /// Maximum number of clean blocks kept in memory for reuse.
    pub clean_cache_blocks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            transactions_enabled: true,
            txns_before_sync: 10,
            fsync_enabled: true,
            clean_cache_blocks: 1024,
        }
    }
}

impl StoreConfig {
    /// Configuration for bulk loading: no transaction log, no fsync.
    pub fn bulk_load() -> Self {
        Self {
            transactions_enabled: false,
            fsync_enabled: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert!(config.transactions_enabled);
        assert_eq!(config.txns_before_sync, 10);
        assert!(config.fsync_enabled);
        assert_eq!(config.clean_cache_blocks, 1024);
    }

    #[test]
    fn test_bulk_load_config() {
        let config = StoreConfig::bulk_load();
        assert!(!config.transactions_enabled);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = StoreConfig {
            transactions_enabled: false,
            txns_before_sync: 3,
            fsync_enabled: false,
            clean_cache_blocks: 16,
        };
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: StoreConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(
            config.transactions_enabled,
            deserialized.transactions_enabled
        );
        assert_eq!(config.txns_before_sync, deserialized.txns_before_sync);
        assert_eq!(config.clean_cache_blocks, deserialized.clean_cache_blocks);
    }
}
