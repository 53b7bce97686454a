//! Compute Backend Abstraction Layer
//!
//! Provides a trait-based abstraction over device backends so the wrapper
//! layer can run against wgpu, the host backend, or anything else.

mod host;
mod traits;

pub use host::{DispatchRecord, HostBackend};
pub use traits::*;
