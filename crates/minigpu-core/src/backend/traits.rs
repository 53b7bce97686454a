//! Compute backend trait definitions
//!
//! These traits define the platform interface that every device backend
//! must implement. The wrapper layer never calls a backend with a handle it
//! knows to be invalid.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{BufferHandle, DataType, ShaderHandle, WorkgroupCount};

/// Error type for backend operations
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Backend context is not initialized")]
    NotInitialized,

    #[error("Unknown buffer handle {}", .0.raw())]
    UnknownBuffer(BufferHandle),

    #[error("Unknown shader handle {}", .0.raw())]
    UnknownShader(ShaderHandle),

    #[error("Shader {} has no kernel loaded", .0.raw())]
    NoKernel(ShaderHandle),

    #[error("Range of {len} bytes at byte offset {offset} exceeds buffer size {size}")]
    OutOfRange { offset: usize, len: usize, size: usize },

    #[error("Kernel compilation failed: {0}")]
    Compilation(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Injected failure in {0}")]
    Injected(&'static str),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// The platform interface a device backend implements.
///
/// Implementations own the native resources behind every handle they mint.
/// Counts are element counts of the given [`DataType`], never byte counts.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Get the name of this backend
    fn name(&self) -> &str;

    /// Bring up the native device context.
    async fn initialize_context(&self) -> BackendResult<()>;

    /// Tear down the native device context, releasing anything still held.
    fn destroy_context(&self) -> BackendResult<()>;

    /// Allocate a device buffer for `element_count` elements of `data_type`.
    fn create_buffer(&self, element_count: usize, data_type: DataType)
    -> BackendResult<BufferHandle>;

    /// Copy `element_count` elements starting at `element_offset` from the
    /// device buffer into `destination`.
    async fn buffer_read(
        &self,
        handle: BufferHandle,
        destination: &mut [u8],
        element_count: usize,
        element_offset: usize,
        data_type: DataType,
    ) -> BackendResult<()>;

    /// Upload `element_count` elements from `source` to the start of the buffer.
    fn buffer_write(
        &self,
        handle: BufferHandle,
        source: &[u8],
        element_count: usize,
        data_type: DataType,
    ) -> BackendResult<()>;

    /// Release a native buffer.
    fn buffer_destroy(&self, handle: BufferHandle) -> BackendResult<()>;

    /// Create an empty native shader.
    fn create_shader(&self) -> BackendResult<ShaderHandle>;

    /// Compile `source` into the shader, replacing any previous kernel.
    fn shader_load_kernel(&self, handle: ShaderHandle, source: &str) -> BackendResult<()>;

    /// Check whether the shader holds a compiled kernel.
    fn shader_has_kernel(&self, handle: ShaderHandle) -> bool;

    /// Bind `buffer` at positional binding `index`.
    fn shader_set_buffer(
        &self,
        handle: ShaderHandle,
        index: u32,
        buffer: BufferHandle,
    ) -> BackendResult<()>;

    /// Drop every binding on the shader while keeping its compiled kernel.
    fn shader_clear_bindings(&self, handle: ShaderHandle) -> BackendResult<()>;

    /// Run the shader's kernel over a 3-D workgroup grid and wait for it.
    async fn shader_dispatch(&self, handle: ShaderHandle, groups: WorkgroupCount)
    -> BackendResult<()>;

    /// Release a native shader.
    fn shader_destroy(&self, handle: ShaderHandle) -> BackendResult<()>;
}

/// A null backend that always returns errors (used when no device is available)
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    fn unavailable() -> BackendError {
        BackendError::Unavailable("No compute backend available".into())
    }
}

#[async_trait]
impl ComputeBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    async fn initialize_context(&self) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn destroy_context(&self) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn create_buffer(
        &self,
        _element_count: usize,
        _data_type: DataType,
    ) -> BackendResult<BufferHandle> {
        Err(Self::unavailable())
    }

    async fn buffer_read(
        &self,
        _handle: BufferHandle,
        _destination: &mut [u8],
        _element_count: usize,
        _element_offset: usize,
        _data_type: DataType,
    ) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn buffer_write(
        &self,
        _handle: BufferHandle,
        _source: &[u8],
        _element_count: usize,
        _data_type: DataType,
    ) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn buffer_destroy(&self, _handle: BufferHandle) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn create_shader(&self) -> BackendResult<ShaderHandle> {
        Err(Self::unavailable())
    }

    fn shader_load_kernel(&self, _handle: ShaderHandle, _source: &str) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn shader_has_kernel(&self, _handle: ShaderHandle) -> bool {
        false
    }

    fn shader_set_buffer(
        &self,
        _handle: ShaderHandle,
        _index: u32,
        _buffer: BufferHandle,
    ) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn shader_clear_bindings(&self, _handle: ShaderHandle) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    async fn shader_dispatch(
        &self,
        _handle: ShaderHandle,
        _groups: WorkgroupCount,
    ) -> BackendResult<()> {
        Err(Self::unavailable())
    }

    fn shader_destroy(&self, _handle: ShaderHandle) -> BackendResult<()> {
        Err(Self::unavailable())
    }
}
