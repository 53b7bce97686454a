//! Error types for the GPU wrapper layer.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;

/// Error type for context, buffer, and shader operations
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU context is already initialized")]
    AlreadyInitialized,

    #[error("GPU context is not initialized")]
    NotInitialized,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to bind buffer to tag '{tag}'")]
    Binding {
        tag: String,
        #[source]
        source: Box<GpuError>,
    },

    #[error("Platform error in {operation}")]
    Platform {
        operation: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{count} elements at offset {offset} exceed buffer capacity of {capacity} elements")]
    OutOfBounds {
        offset: usize,
        count: usize,
        capacity: usize,
    },

    #[error("Failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GpuError {
    /// Wrap a backend failure, annotated with the operation that raised it.
    pub fn platform(operation: &'static str) -> impl FnOnce(BackendError) -> GpuError {
        move |source| GpuError::Platform { operation, source }
    }

    /// Wrap a failure that occurred while binding `tag`.
    pub fn binding(tag: &str, source: GpuError) -> GpuError {
        GpuError::Binding {
            tag: tag.to_string(),
            source: Box::new(source),
        }
    }
}

/// Result type for wrapper operations
pub type Result<T> = std::result::Result<T, GpuError>;
