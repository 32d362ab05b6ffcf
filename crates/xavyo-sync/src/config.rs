//! Sync engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Configuration for a synchronization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    /// Number of connected system objects per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Number of objects reloaded per batch during cross-page reference resolution.
    #[serde(default = "default_cross_page_batch_size")]
    pub cross_page_batch_size: usize,
    /// Persist run progress every N pages.
    #[serde(default = "default_progress_update_interval")]
    pub progress_update_interval: usize,
    /// Evaluate every object but skip all repository writes.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_page_size() -> usize {
    500
}

fn default_cross_page_batch_size() -> usize {
    200
}

fn default_progress_update_interval() -> usize {
    1
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            cross_page_batch_size: default_cross_page_batch_size(),
            progress_update_interval: default_progress_update_interval(),
            dry_run: false,
        }
    }
}

impl SyncEngineConfig {
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_cross_page_batch_size(mut self, size: usize) -> Self {
        self.cross_page_batch_size = size;
        self
    }

    #[must_use]
    pub fn with_progress_update_interval(mut self, pages: usize) -> Self {
        self.progress_update_interval = pages;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.page_size == 0 {
            return Err(SyncError::configuration("page_size must be greater than 0"));
        }
        if self.cross_page_batch_size == 0 {
            return Err(SyncError::configuration(
                "cross_page_batch_size must be greater than 0",
            ));
        }
        if self.progress_update_interval == 0 {
            return Err(SyncError::configuration(
                "progress_update_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SyncEngineConfig::default();
        assert_eq!(config.page_size, 500);
        assert_eq!(config.cross_page_batch_size, 200);
        assert_eq!(config.progress_update_interval, 1);
        assert!(!config.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialize_fills_defaults() {
        let config: SyncEngineConfig = serde_json::from_str(r#"{"page_size": 50}"#).unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.cross_page_batch_size, 200);
    }

    #[test]
    fn test_config_rejects_zero_page_size() {
        let config = SyncEngineConfig::default().with_page_size(0);
        assert!(matches!(
            config.validate(),
            Err(SyncError::Configuration { .. })
        ));
    }
}
