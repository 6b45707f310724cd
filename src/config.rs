//! Tunables for integrity tree storages
//!
//! Defaults are the reference values; a TOML file can override them:
//!
//! ```toml
//! access_count_max = 5
//! access_timeout_ms = 10
//!
//! [save_data]
//! data = 32
//! hash = 4
//!
//! [archive]
//! data = 24
//! hash = 8
//! ```

use crate::error::{IntegrityError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Kind of image protected by a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Writable save data, small caches, cleared-block semantics
    SaveData,
    /// Read-mostly archive image, larger caches
    Archive,
}

/// Cache entry counts for one storage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounts {
    /// Entries in the bottom (data) level cache
    pub data: usize,
    /// Entries in each hash level cache
    pub hash: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub save_data: CacheCounts,
    pub archive: CacheCounts,
    /// Concurrent holders allowed per admission semaphore
    pub access_count_max: usize,
    /// Fast-path wait before the proactive cache flush
    pub access_timeout_ms: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            save_data: CacheCounts { data: 32, hash: 4 },
            archive: CacheCounts { data: 24, hash: 8 },
            access_count_max: 5,
            access_timeout_ms: 10,
        }
    }
}

impl TreeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TreeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, counts) in [("save_data", &self.save_data), ("archive", &self.archive)] {
            if counts.data == 0 || counts.hash == 0 {
                return Err(IntegrityError::InvalidConfig(format!(
                    "{} cache counts must be non-zero",
                    name
                )));
            }
        }

        if self.access_count_max == 0 {
            return Err(IntegrityError::InvalidConfig(
                "access_count_max must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Cache entry counts for `kind`
    pub fn cache_counts(&self, kind: StorageKind) -> CacheCounts {
        match kind {
            StorageKind::SaveData => self.save_data,
            StorageKind::Archive => self.archive,
        }
    }

    pub fn access_timeout(&self) -> Duration {
        Duration::from_millis(self.access_timeout_ms)
    }
}
