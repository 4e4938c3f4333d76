//! Configuration for update buffering, reader pooling and soft deletes.

use serde::{Deserialize, Serialize};

use crate::error::{PalisadeError, Result};

/// Tunables shared by the accumulator, the updates stream and the reader pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    /// Doc-values field whose presence marks a document as soft-deleted.
    ///
    /// When set, every pooled segment tracks deletions with the soft-delete
    /// tracker instead of the hard-delete one.
    pub soft_deletes_field: Option<String>,

    /// Start the reader pool with pooling already enabled.
    pub pool_readers: bool,

    /// RAM budget for buffered deletes and updates, in megabytes.
    pub ram_buffer_size_mb: f64,

    /// Flush once this many delete terms have been buffered.
    pub max_buffered_delete_terms: Option<usize>,

    /// Keep segments whose documents are all deleted instead of reporting them for drop.
    pub keep_fully_deleted_segments: bool,

    /// Cross-check a freshly opened reader's deletions against the commit descriptor.
    pub check_segment_integrity: bool,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        UpdatesConfig {
            soft_deletes_field: None,
            pool_readers: false,
            ram_buffer_size_mb: 16.0,
            max_buffered_delete_terms: None,
            keep_fully_deleted_segments: false,
            check_segment_integrity: true,
        }
    }
}

impl UpdatesConfig {
    /// Use `field` as the soft-deletes field.
    pub fn with_soft_deletes_field<S: Into<String>>(mut self, field: S) -> Self {
        self.soft_deletes_field = Some(field.into());
        self
    }

    /// Enable reader pooling from the start.
    pub fn with_pool_readers(mut self, pool_readers: bool) -> Self {
        self.pool_readers = pool_readers;
        self
    }

    /// Set the RAM budget in megabytes.
    pub fn with_ram_buffer_size_mb(mut self, mb: f64) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    /// Set the delete-term flush trigger.
    pub fn with_max_buffered_delete_terms(mut self, terms: usize) -> Self {
        self.max_buffered_delete_terms = Some(terms);
        self
    }

    /// Keep fully deleted segments around.
    pub fn with_keep_fully_deleted_segments(mut self, keep: bool) -> Self {
        self.keep_fully_deleted_segments = keep;
        self
    }

    /// RAM budget in bytes.
    pub fn ram_buffer_size_bytes(&self) -> u64 {
        (self.ram_buffer_size_mb * 1024.0 * 1024.0) as u64
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.ram_buffer_size_mb <= 0.0 || !self.ram_buffer_size_mb.is_finite() {
            return Err(PalisadeError::invalid_config(format!(
                "ram_buffer_size_mb must be a positive number, got {}",
                self.ram_buffer_size_mb
            )));
        }

        if self.max_buffered_delete_terms == Some(0) {
            return Err(PalisadeError::invalid_config(
                "max_buffered_delete_terms must be at least 1",
            ));
        }

        if let Some(field) = &self.soft_deletes_field
            && field.is_empty()
        {
            return Err(PalisadeError::invalid_config(
                "soft_deletes_field must not be empty",
            ));
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: UpdatesConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpdatesConfig::default();
        assert!(config.soft_deletes_field.is_none());
        assert!(!config.pool_readers);
        assert_eq!(config.ram_buffer_size_bytes(), 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = UpdatesConfig::default()
            .with_soft_deletes_field("__soft_deletes")
            .with_pool_readers(true)
            .with_max_buffered_delete_terms(1000);

        assert_eq!(config.soft_deletes_field.as_deref(), Some("__soft_deletes"));
        assert!(config.pool_readers);
        assert_eq!(config.max_buffered_delete_terms, Some(1000));
    }

    #[test]
    fn test_json_roundtrip_and_partial_json() {
        let config = UpdatesConfig::default().with_soft_deletes_field("soft");
        let json = config.to_json().unwrap();
        assert_eq!(UpdatesConfig::from_json(&json).unwrap(), config);

        let partial = UpdatesConfig::from_json(r#"{"pool_readers": true}"#).unwrap();
        assert!(partial.pool_readers);
        assert_eq!(partial.ram_buffer_size_mb, 16.0);
    }

    #[test]
    fn test_validation() {
        let config = UpdatesConfig::default().with_ram_buffer_size_mb(0.0);
        assert!(config.validate().is_err());

        let config = UpdatesConfig::default().with_max_buffered_delete_terms(0);
        assert!(config.validate().is_err());

        let config = UpdatesConfig::default().with_soft_deletes_field("");
        assert!(config.validate().is_err());

        assert!(UpdatesConfig::from_json(r#"{"ram_buffer_size_mb": -1.0}"#).is_err());
    }
}
