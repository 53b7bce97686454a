//! minigpu core
//!
//! Resource lifecycle and shader caching for GPU compute.
//!
//! # Architecture
//!
//! - [`backend::ComputeBackend`] - Platform interface a device backend implements
//! - [`ContextManager`] - Context lifecycle and resource factory
//! - [`Buffer`] - Device buffer with bounds-checked transfers
//! - [`ComputeShader`] - Kernel with tag-based positional bindings
//! - [`CachedComputeShader`] - Shader whose compilation is shared by source content
//! - [`convert`] - Device-side packing of narrow integers and `f64` words
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use minigpu_core::{ContextManager, DataType};
//!
//! let mut ctx = ContextManager::new(Arc::new(backend));
//! ctx.init().await?;
//!
//! let data = ctx.create_buffer(1024, DataType::Int32)?;
//! data.write(&input, 1024, DataType::Int32)?;
//!
//! let mut shader = ctx.create_compute_shader();
//! shader.load_kernel_string(KERNEL)?;
//! shader.set_buffer("data", &data)?;
//! shader.dispatch(4, 1, 1).await?;
//!
//! let output: Vec<i32> = data.to_vec().await?;
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod convert;
pub mod error;
pub mod shader;
pub mod types;

pub use backend::{BackendError, BackendResult, ComputeBackend, HostBackend, NullBackend};
pub use buffer::Buffer;
pub use config::{ConfigError, ContextConfig};
pub use context::ContextManager;
pub use convert::PackedFormat;
pub use error::{GpuError, Result};
pub use shader::{CachedComputeShader, ComputeShader, ContentKey};
pub use types::{BufferHandle, DataType, ShaderHandle, WorkgroupCount};
