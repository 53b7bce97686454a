//! minigpu wgpu backend
//!
//! Implements [`minigpu_core::ComputeBackend`] on top of wgpu so the core's
//! contexts, buffers and shaders run on Vulkan, Metal, DX12 or GL.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use minigpu_core::ContextManager;
//! use minigpu_wgpu::{WgpuBackend, WgpuConfig};
//!
//! let backend = WgpuBackend::with_config(WgpuConfig::default());
//! let mut ctx = ContextManager::new(Arc::new(backend));
//! ctx.init().await?;
//! ```

pub mod config;
pub mod context;

pub use config::{BackendSet, PowerPreference, WgpuConfig};
pub use context::WgpuBackend;
