//! Compute shaders and the content-keyed shader cache.

pub(crate) mod cache;
mod cached;
mod compute;

pub use cache::ContentKey;
pub use cached::CachedComputeShader;
pub use compute::ComputeShader;
