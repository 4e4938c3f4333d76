//! Storage abstraction used to persist live-docs and field-update generations.
//!
//! The reconciliation core never touches a filesystem directly. Everything it
//! persists goes through the [`Storage`] trait, so the same code runs against
//! the in-memory backend in tests and the file backend in production.
//!
//! # Example
//!
//! ```
//! use std::io::{Read, Write};
//!
//! use palisade::storage::{StorageConfig, StorageFactory};
//! use palisade::storage::memory::MemoryStorageConfig;
//!
//! # fn main() -> palisade::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//!
//! let mut output = storage.create_output("_0_1.liv")?;
//! output.write_all(b"bits")?;
//! output.close()?;
//!
//! let mut input = storage.open_input("_0_1.liv")?;
//! let mut buffer = Vec::new();
//! input.read_to_end(&mut buffer)?;
//! assert_eq!(buffer, b"bits");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::{PalisadeError, Result};

pub mod file;
pub mod memory;
pub mod structured;

pub use structured::{StructReader, StructWriter};

/// A trait for storage backends that can store and retrieve named files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating it if it already exists.
    ///
    /// The contents become visible once the returned output is closed.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Make all closed outputs durable.
    fn sync(&self) -> Result<()>;
}

/// A readable file handle.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Total size of the underlying file.
    fn size(&self) -> Result<u64>;

    /// Close the input.
    fn close(&mut self) -> Result<()>;
}

/// A writable file handle.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush buffered bytes and sync them to the backend.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Current write position.
    fn position(&self) -> Result<u64>;

    /// Close the output, publishing its contents.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// Configuration for the supported storage backends.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Disk-backed storage rooted at a directory.
    File(file::FileStorageConfig),

    /// Process-local storage for tests and temporary indexes.
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// Helper for constructing storage backends from configuration.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a storage instance for the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => Ok(Arc::new(memory::MemoryStorage::new(mem_config))),
            StorageConfig::File(file_config) => {
                let path = file_config.path.clone();
                Ok(Arc::new(file::FileStorage::new(&path, file_config)?))
            }
        }
    }
}

/// Storage-specific error conditions.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Storage is closed.
    StorageClosed,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for PalisadeError {
    fn from(err: StorageError) -> Self {
        PalisadeError::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageConfig;
    use crate::storage::memory::MemoryStorageConfig;

    #[test]
    fn test_storage_config_default() {
        match StorageConfig::default() {
            StorageConfig::Memory(mem_config) => {
                assert_eq!(mem_config.initial_capacity, 16);
            }
            _ => panic!("Expected Memory config"),
        }
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("_0_1.liv".to_string());
        assert_eq!(err.to_string(), "File not found: _0_1.liv");

        let err = StorageError::StorageClosed;
        assert_eq!(err.to_string(), "Storage is closed");

        let err: PalisadeError = StorageError::IoError("disk full".to_string()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_storage_factory_memory() {
        let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))
            .unwrap();
        assert!(!storage.file_exists("_0_1.liv"));
    }

    #[test]
    fn test_storage_factory_file() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig::File(FileStorageConfig::new(temp_dir.path()));
        let storage = StorageFactory::create(config).unwrap();

        let mut output = storage.create_output("_0_1.liv").unwrap();
        output.write_all(b"live").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("_0_1.liv").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"live");
    }
}
