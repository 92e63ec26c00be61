//! Configuration for memory segments.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PilumError, Result};

/// Default memory budget of a single buffered segment (128 MiB).
pub const MAX_TABLE_FILE_MEM: usize = 128 * 1024 * 1024;

/// Size of one vector element in bytes.
pub const FLOAT_TYPE_SIZE: usize = std::mem::size_of::<f32>();

/// Largest vector dimension a collection schema may declare.
pub const MAX_DIMENSION: usize = 32_768;

/// Name of the vector field whose params carry the dimension.
pub const DEFAULT_VECTOR_FIELD: &str = "vector";

/// Param key holding the dimension of the vector field.
pub const DEFAULT_DIMENSION_PARAM: &str = "dimension";

/// Element name recorded on segment files holding raw vectors.
pub const DEFAULT_RAW_ELEMENT: &str = "raw";

/// Settings shared by every memory segment of one ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemSegmentConfig {
    /// Memory budget per segment in bytes.
    pub max_segment_bytes: usize,

    /// Vector field looked up in the collection schema.
    pub vector_field: String,

    /// Key of the dimension entry in the vector field params.
    pub dimension_param: String,

    /// Element name of the raw vector segment file.
    pub raw_element: String,

    /// Whether flushed files are fsynced before being published.
    pub sync_on_flush: bool,
}

impl Default for MemSegmentConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: MAX_TABLE_FILE_MEM,
            vector_field: DEFAULT_VECTOR_FIELD.to_string(),
            dimension_param: DEFAULT_DIMENSION_PARAM.to_string(),
            raw_element: DEFAULT_RAW_ELEMENT.to_string(),
            sync_on_flush: true,
        }
    }
}

impl MemSegmentConfig {
    /// Default configuration with a different memory budget.
    pub fn with_budget(max_segment_bytes: usize) -> Self {
        Self {
            max_segment_bytes,
            ..Self::default()
        }
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_bytes == 0 {
            return Err(PilumError::invalid_config(
                "max_segment_bytes must be greater than zero",
            ));
        }
        if self.vector_field.is_empty() {
            return Err(PilumError::invalid_config("vector_field must not be empty"));
        }
        if self.dimension_param.is_empty() {
            return Err(PilumError::invalid_config(
                "dimension_param must not be empty",
            ));
        }
        if self.raw_element.is_empty() {
            return Err(PilumError::invalid_config("raw_element must not be empty"));
        }
        Ok(())
    }

    /// Load and validate a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: MemSegmentConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}
