//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! chunk_size = 65536
//! max_file_size = 1073741824
//! max_retries = 100
//! reserved_xattr_names = ["com.apple.ResourceFork"]
//!
//! [statfs]
//! blocks = 1048576
//! ```

use std::path::Path;

use kvfs_kv::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Default maximum bytes per stored chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum bytes per stored chunk.
    pub chunk_size: usize,
    /// Largest logical file size a write or truncate may produce.
    pub max_file_size: u64,
    /// Transaction attempts before giving up on conflicts.
    pub max_retries: u32,
    /// Extended attribute names that are always refused.
    pub reserved_xattr_names: Vec<String>,
    /// Owner given to newly made nodes.
    pub default_uid: u32,
    /// Group given to newly made nodes.
    pub default_gid: u32,
    /// Figures reported by `statfs`.
    pub statfs: StatFsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: i64::MAX as u64,
            max_retries: 100,
            reserved_xattr_names: vec!["com.apple.ResourceFork".to_string()],
            default_uid: 0,
            default_gid: 0,
            statfs: StatFsConfig::default(),
        }
    }
}

/// Block and inode figures for `statfs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatFsConfig {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

impl Default for StatFsConfig {
    fn default() -> Self {
        Self {
            blocks: 1024 * 1024,
            bfree: 512 * 1024,
            bavail: 512 * 1024,
            files: 1024 * 1024,
            ffree: 512 * 1024,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> FsResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| FsError::invalid(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> FsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FsError::invalid(format!("config {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check field ranges.
    pub fn validate(&self) -> FsResult<()> {
        if self.chunk_size == 0 {
            return Err(FsError::invalid("chunk_size must be greater than zero"));
        }
        if self.max_retries == 0 {
            return Err(FsError::invalid("max_retries must be greater than zero"));
        }
        Ok(())
    }

    /// Retry policy for a store serving this engine.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_retries)
    }

    /// Returns true if `name` may never be stored as an extended attribute.
    pub fn is_reserved_xattr(&self, name: &str) -> bool {
        self.reserved_xattr_names.iter().any(|r| r == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.max_file_size, i64::MAX as u64);
        assert!(config.is_reserved_xattr("com.apple.ResourceFork"));
        assert!(!config.is_reserved_xattr("user.comment"));
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            chunk_size = 8
            reserved_xattr_names = []

            [statfs]
            blocks = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 8);
        assert!(config.reserved_xattr_names.is_empty());
        assert_eq!(config.statfs.blocks, 10);
        assert_eq!(config.statfs.files, StatFsConfig::default().files);
        assert_eq!(config.max_retries, 100);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = EngineConfig::from_toml_str("chunk_size = 0").unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[test]
    fn test_malformed_document_rejected() {
        let err = EngineConfig::from_toml_str("chunk_size = \"big\"").unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_retries = 7").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.retry_policy().max_attempts, 7);

        assert!(EngineConfig::load("/nonexistent/kvfs.toml").is_err());
    }
}
