//! Compute shader decorator that shares compilation by source content.

use std::path::Path;
use std::sync::Arc;

use super::cache::{ContentKey, SharedShader};
use super::compute::{dispatch_on, read_kernel_file};
use crate::buffer::Buffer;
use crate::context::ContextShared;
use crate::error::{GpuError, Result};
use crate::types::WorkgroupCount;

/// A compute shader whose kernel comes from the context's shader cache.
///
/// Every instance loaded with the same source delegates to one canonical
/// [`ComputeShader`](super::ComputeShader), so the kernel is compiled once
/// per context. Binding state lives on that canonical shader and is
/// therefore shared too. Each load starts a fresh binding session for all
/// instances that share it.
///
/// Before the first successful load the wrapper has no kernel: `set_buffer`
/// and `dispatch` fail with [`GpuError::InvalidState`].
pub struct CachedComputeShader {
    context: Arc<ContextShared>,
    canonical: Option<SharedShader>,
}

impl CachedComputeShader {
    pub(crate) fn new(context: Arc<ContextShared>) -> Self {
        Self {
            context,
            canonical: None,
        }
    }

    fn canonical(&self) -> Result<&SharedShader> {
        self.canonical
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no kernel has been loaded".into()))
    }

    /// Resolves `source` through the cache, compiling it only on a miss.
    pub fn load_kernel_string(&mut self, source: &str) -> Result<()> {
        if source.trim().is_empty() {
            return Err(GpuError::InvalidArgument("kernel source is empty".into()));
        }
        self.canonical = None;

        let shared = self.context.get_or_create_cached_shader(source)?;
        {
            let mut shader = shared.lock();
            if !shader.has_kernel() {
                shader.load_kernel_string(source)?;
            }
            shader.begin_binding_session()?;
        }
        self.canonical = Some(shared);
        Ok(())
    }

    /// Reads WGSL from `path` and loads it through the cache.
    pub fn load_kernel_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let source = read_kernel_file(path.as_ref())?;
        self.load_kernel_string(&source)
    }

    pub fn has_kernel(&self) -> bool {
        self.canonical
            .as_ref()
            .is_some_and(|shader| shader.lock().has_kernel())
    }

    /// Binds `buffer` under `tag` on the shared kernel.
    pub fn set_buffer(&mut self, tag: &str, buffer: &Buffer) -> Result<u32> {
        self.canonical()?.lock().set_buffer(tag, buffer)
    }

    pub fn binding_index(&self, tag: &str) -> Option<u32> {
        self.canonical
            .as_ref()
            .and_then(|shader| shader.lock().binding_index(tag))
    }

    pub fn binding_count(&self) -> usize {
        self.canonical
            .as_ref()
            .map_or(0, |shader| shader.lock().binding_count())
    }

    /// Runs the shared kernel and waits for completion.
    pub async fn dispatch(&self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<()> {
        // The shader lock is not held across the await.
        let handle = self.canonical()?.lock().dispatch_target()?;
        dispatch_on(
            &self.context,
            handle,
            WorkgroupCount::new(groups_x, groups_y, groups_z),
        )
        .await
    }

    /// Source of the currently loaded kernel.
    pub fn source(&self) -> Option<String> {
        self.canonical
            .as_ref()
            .and_then(|shader| shader.lock().source().map(str::to_string))
    }

    /// Cache key of the currently loaded kernel.
    pub fn content_key(&self) -> Option<ContentKey> {
        self.source().map(|source| ContentKey::of(&source))
    }

    /// True if both wrappers delegate to the same compiled kernel.
    pub fn shares_kernel_with(&self, other: &CachedComputeShader) -> bool {
        match (&self.canonical, &other.canonical) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.canonical
            .as_ref()
            .is_some_and(|shader| shader.lock().is_valid())
    }
}

impl std::fmt::Debug for CachedComputeShader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedComputeShader")
            .field("content_key", &self.content_key().map(|k| k.to_string()))
            .finish()
    }
}
