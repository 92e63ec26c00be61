//! Storage abstraction layer for Pilum.
//!
//! Flushed segments are written through the [`Storage`] trait so the durable
//! medium can be swapped without touching the buffering code. Two backends
//! ship with the crate:
//!
//! - [`file::FileStorage`]: directory-backed, buffered writes with optional
//!   fsync on every write and a full sync on close.
//! - [`memory::MemoryStorage`]: in-memory map of files, used by tests and demos.
//!
//! # Example
//!
//! ```
//! use pilum::storage::{StorageConfig, StorageFactory};
//! use pilum::storage::memory::MemoryStorageConfig;
//!
//! # fn main() -> pilum::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! assert!(storage.list_files()?.is_empty());
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::{PilumError, Result};

pub mod file;
pub mod memory;

use file::{FileStorage, FileStorageConfig};
use memory::{MemoryStorage, MemoryStorageConfig};

/// A trait for storage backends that can store and retrieve data.
///
/// Names are flat, relative to the storage root.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing content.
    ///
    /// The content becomes visible under `name` once the output is closed.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file succeeds.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing `new_name` if it exists.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, publishing its content under its name.
    fn close(&mut self) -> Result<()>;
}

// Implement StorageOutput for Box<dyn StorageOutput> to allow trait objects
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
}

/// Storage backend selection.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Directory-backed storage.
    File(FileStorageConfig),
    /// In-memory storage.
    Memory(MemoryStorageConfig),
}

/// Helper for constructing concrete storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a storage backend from its configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::File(file_config) => Ok(Arc::new(FileStorage::new(file_config)?)),
            StorageConfig::Memory(memory_config) => Ok(Arc::new(MemoryStorage::new(memory_config))),
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Output already closed.
    OutputClosed(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::OutputClosed(name) => write!(f, "Output is closed: {name}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for PilumError {
    fn from(err: StorageError) -> Self {
        PilumError::storage(err.to_string())
    }
}

/// Write `bytes` to `name` through a temporary file, renaming it into place only
/// after the content has been fully written and synced.
///
/// Returns the number of bytes written. On failure the temporary file is removed
/// and nothing appears under `name`.
pub fn write_atomic(storage: &dyn Storage, name: &str, bytes: &[u8], sync: bool) -> Result<u64> {
    let temp_name = format!("{name}.{}.tmp", uuid::Uuid::new_v4().simple());

    let written = (|| -> Result<u64> {
        let mut output = storage.create_output(&temp_name)?;
        output.write_all(bytes)?;
        if sync {
            output.flush_and_sync()?;
        }
        let position = output.position()?;
        output.close()?;
        Ok(position)
    })();

    let written = match written {
        Ok(written) => written,
        Err(err) => {
            if let Err(cleanup) = storage.delete_file(&temp_name) {
                log::warn!("failed to remove temporary file {temp_name}: {cleanup}");
            }
            return Err(err);
        }
    };

    if let Err(err) = storage.rename_file(&temp_name, name) {
        if let Err(cleanup) = storage.delete_file(&temp_name) {
            log::warn!("failed to remove temporary file {temp_name}: {cleanup}");
        }
        return Err(err);
    }
    if sync {
        storage.sync()?;
    }

    Ok(written)
}

/// Read a whole file into memory.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut buffer = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut buffer)?;
    Ok(buffer)
}
