//! Compute shader wrapper with tag-based positional bindings.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::buffer::Buffer;
use crate::context::ContextShared;
use crate::error::{GpuError, Result};
use crate::types::{ShaderHandle, WorkgroupCount};

/// A compute shader owning one native kernel handle.
///
/// Buffers are bound by symbolic tag. Within one binding session (the span
/// between two kernel loads) each new tag takes the next positional index,
/// starting from 0, and a repeated tag keeps the index it was first given.
///
/// Dispatch fails fast with [`GpuError::InvalidState`] when no kernel is
/// loaded or when no buffer has been bound in the current session. Bindings
/// the kernel declares but that were never set are rejected by the backend
/// and surface as [`GpuError::Platform`].
pub struct ComputeShader {
    context: Arc<ContextShared>,
    session: Uuid,
    handle: Option<ShaderHandle>,
    source: Option<String>,
    bindings: HashMap<String, u32>,
}

impl ComputeShader {
    pub(crate) fn new(context: Arc<ContextShared>) -> Result<Self> {
        let session = context.require_session()?;
        let handle = context
            .backend()
            .create_shader()
            .map_err(GpuError::platform("create_shader"))?;
        context.track_shader();
        tracing::debug!("Created compute shader {}", handle.raw());

        Ok(Self {
            context,
            session,
            handle: Some(handle),
            source: None,
            bindings: HashMap::new(),
        })
    }

    fn live_handle(&self) -> Result<ShaderHandle> {
        let handle = self
            .handle
            .ok_or_else(|| GpuError::InvalidState("compute shader has been destroyed".into()))?;
        self.context.check_session(self.session)?;
        Ok(handle)
    }

    /// Compiles `source` and starts a fresh binding session.
    pub fn load_kernel_string(&mut self, source: &str) -> Result<()> {
        if source.trim().is_empty() {
            return Err(GpuError::InvalidArgument("kernel source is empty".into()));
        }
        let handle = self.live_handle()?;

        self.bindings.clear();
        if let Err(e) = self.context.backend().shader_load_kernel(handle, source) {
            self.source = None;
            return Err(GpuError::platform("shader_load_kernel")(e));
        }
        self.source = Some(source.to_string());
        tracing::debug!(
            "Loaded kernel into shader {} ({} bytes)",
            handle.raw(),
            source.len()
        );
        Ok(())
    }

    /// Reads WGSL from `path` and loads it.
    pub fn load_kernel_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let source = read_kernel_file(path.as_ref())?;
        self.load_kernel_string(&source)
    }

    /// True if a kernel load has succeeded and the shader is still alive.
    pub fn has_kernel(&self) -> bool {
        match self.live_handle() {
            Ok(handle) => self.source.is_some() && self.context.backend().shader_has_kernel(handle),
            Err(_) => false,
        }
    }

    /// Currently loaded kernel source.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Clears the tag map and the native bindings without recompiling.
    pub(crate) fn begin_binding_session(&mut self) -> Result<()> {
        let handle = self.live_handle()?;
        self.bindings.clear();
        self.context
            .backend()
            .shader_clear_bindings(handle)
            .map_err(GpuError::platform("shader_clear_bindings"))
    }

    /// Binds `buffer` under `tag`, returning the positional index it landed on.
    pub fn set_buffer(&mut self, tag: &str, buffer: &Buffer) -> Result<u32> {
        let handle = self.live_handle()?;
        let buffer_handle = buffer
            .bind_handle(&self.context)
            .map_err(|e| GpuError::binding(tag, e))?;

        let index = match self.bindings.get(tag) {
            Some(index) => *index,
            None => self.bindings.len() as u32,
        };
        self.context
            .backend()
            .shader_set_buffer(handle, index, buffer_handle)
            .map_err(|e| GpuError::binding(tag, GpuError::platform("shader_set_buffer")(e)))?;

        self.bindings.entry(tag.to_string()).or_insert(index);
        tracing::debug!(
            "Shader {} bound '{}' to index {} (buffer {})",
            handle.raw(),
            tag,
            index,
            buffer_handle.raw()
        );
        Ok(index)
    }

    /// Index assigned to `tag` in the current binding session.
    pub fn binding_index(&self, tag: &str) -> Option<u32> {
        self.bindings.get(tag).copied()
    }

    /// Number of distinct tags bound in the current binding session.
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Validates that the shader can be dispatched and returns its handle.
    ///
    /// A kernel that declares no bindings is rejected here as well. The
    /// wrapper cannot tell such a kernel from one whose buffers were never
    /// set, and the second case is the one callers hit in practice.
    pub(crate) fn dispatch_target(&self) -> Result<ShaderHandle> {
        let handle = self.live_handle()?;
        if self.source.is_none() || !self.context.backend().shader_has_kernel(handle) {
            return Err(GpuError::InvalidState(
                "dispatch requires a loaded kernel".into(),
            ));
        }
        if self.bindings.is_empty() {
            return Err(GpuError::InvalidState(
                "dispatch requires at least one bound buffer".into(),
            ));
        }
        Ok(handle)
    }

    /// Runs the kernel over a `groups_x` x `groups_y` x `groups_z` grid and
    /// waits for completion.
    pub async fn dispatch(&self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<()> {
        let handle = self.dispatch_target()?;
        dispatch_on(
            &self.context,
            handle,
            WorkgroupCount::new(groups_x, groups_y, groups_z),
        )
        .await
    }

    /// True until destroyed or until the context session ends.
    pub fn is_valid(&self) -> bool {
        self.handle.is_some() && self.context.is_current(self.session)
    }

    /// Releases the native shader. Later calls do nothing.
    pub fn destroy(&mut self) {
        self.source = None;
        self.bindings.clear();
        // Taking the handle detaches it from the release in `Drop`.
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !self.context.is_current(self.session) {
            return;
        }
        if let Err(e) = self.context.backend().shader_destroy(handle) {
            tracing::warn!("Failed to release compute shader {}: {}", handle.raw(), e);
        }
        self.context.untrack_shader();
        tracing::debug!("Destroyed compute shader {}", handle.raw());
    }
}

impl Drop for ComputeShader {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ComputeShader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeShader")
            .field("handle", &self.handle)
            .field("has_source", &self.source.is_some())
            .field("bindings", &self.bindings)
            .finish()
    }
}

pub(crate) fn read_kernel_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| GpuError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Submits a dispatch for an already validated shader handle.
pub(crate) async fn dispatch_on(
    context: &ContextShared,
    handle: ShaderHandle,
    groups: WorkgroupCount,
) -> Result<()> {
    if groups.is_empty() {
        tracing::debug!("Skipping empty dispatch {:?} on shader {}", groups, handle.raw());
        return Ok(());
    }
    context
        .backend()
        .shader_dispatch(handle, groups)
        .await
        .map_err(GpuError::platform("shader_dispatch"))
}
