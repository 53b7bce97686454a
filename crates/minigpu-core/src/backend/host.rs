//! Host Compute Backend
//!
//! In-process reference backend that keeps buffers in host memory.
//!
//! It does not execute kernels. Loads are counted and dispatches are
//! recorded, which makes it the backend of choice for exercising the
//! wrapper layer without a device.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendError, BackendResult, ComputeBackend};
use crate::types::{BufferHandle, DataType, ShaderHandle, WorkgroupCount};

/// A dispatch observed by the host backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub shader: ShaderHandle,
    pub groups: WorkgroupCount,
    /// Bound buffers in binding-index order
    pub bindings: Vec<(u32, BufferHandle)>,
    /// Kernel source that was current at dispatch time
    pub source: String,
}

#[derive(Debug, Default)]
struct HostShader {
    source: Option<String>,
    bindings: BTreeMap<u32, BufferHandle>,
}

#[derive(Debug, Default)]
struct HostState {
    initialized: bool,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    shaders: HashMap<ShaderHandle, HostShader>,
    dispatches: Vec<DispatchRecord>,
    failures: HashSet<&'static str>,
}

impl HostState {
    fn check(&self, operation: &'static str) -> BackendResult<()> {
        if self.failures.contains(operation) {
            return Err(BackendError::Injected(operation));
        }
        if !self.initialized {
            return Err(BackendError::NotInitialized);
        }
        Ok(())
    }
}

/// Host-memory backend
pub struct HostBackend {
    state: Mutex<HostState>,
    next_handle: AtomicU64,
    compile_count: AtomicUsize,
}

impl HostBackend {
    /// Create a new host backend
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            next_handle: AtomicU64::new(1),
            compile_count: AtomicUsize::new(0),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of kernel compilations that reached this backend.
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::SeqCst)
    }

    /// Every dispatch seen so far, oldest first.
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state.lock().dispatches.clone()
    }

    /// Number of native buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of native shaders currently allocated.
    pub fn live_shaders(&self) -> usize {
        self.state.lock().shaders.len()
    }

    /// Whether the context is currently up.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Raw bytes of a buffer, if it exists.
    pub fn buffer_contents(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&handle).cloned()
    }

    /// Make every subsequent call to `operation` fail with
    /// [`BackendError::Injected`].
    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().failures.insert(operation);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    fn byte_range(
        data_type: DataType,
        element_offset: usize,
        element_count: usize,
        size: usize,
    ) -> BackendResult<std::ops::Range<usize>> {
        let overflow = || BackendError::OutOfRange {
            offset: usize::MAX,
            len: usize::MAX,
            size,
        };
        let offset = data_type.byte_len(element_offset).ok_or_else(overflow)?;
        let len = data_type.byte_len(element_count).ok_or_else(overflow)?;
        let end = offset.checked_add(len).ok_or_else(overflow)?;
        if end > size {
            return Err(BackendError::OutOfRange { offset, len, size });
        }
        Ok(offset..end)
    }

    fn read_now(
        &self,
        handle: BufferHandle,
        destination: &mut [u8],
        element_count: usize,
        element_offset: usize,
        data_type: DataType,
    ) -> BackendResult<()> {
        let state = self.state.lock();
        state.check("buffer_read")?;
        let data = state
            .buffers
            .get(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))?;
        let range = Self::byte_range(data_type, element_offset, element_count, data.len())?;
        let len = range.len();
        if destination.len() < len {
            return Err(BackendError::Transfer(format!(
                "destination holds {} bytes, {} required",
                destination.len(),
                len
            )));
        }
        destination[..len].copy_from_slice(&data[range]);
        Ok(())
    }

    fn dispatch_now(&self, handle: ShaderHandle, groups: WorkgroupCount) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("shader_dispatch")?;
        let shader = state
            .shaders
            .get(&handle)
            .ok_or(BackendError::UnknownShader(handle))?;
        let source = shader.source.clone().ok_or(BackendError::NoKernel(handle))?;
        let bindings: Vec<(u32, BufferHandle)> =
            shader.bindings.iter().map(|(i, b)| (*i, *b)).collect();
        if let Some((_, missing)) = bindings
            .iter()
            .find(|(_, b)| !state.buffers.contains_key(b))
        {
            return Err(BackendError::UnknownBuffer(*missing));
        }
        state.dispatches.push(DispatchRecord {
            shader: handle,
            groups,
            bindings,
            source,
        });
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    async fn initialize_context(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.failures.contains("initialize_context") {
            return Err(BackendError::Injected("initialize_context"));
        }
        state.initialized = true;
        Ok(())
    }

    fn destroy_context(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("destroy_context")?;
        state.buffers.clear();
        state.shaders.clear();
        state.initialized = false;
        Ok(())
    }

    fn create_buffer(
        &self,
        element_count: usize,
        data_type: DataType,
    ) -> BackendResult<BufferHandle> {
        let mut state = self.state.lock();
        state.check("create_buffer")?;
        let size = data_type
            .byte_len(element_count)
            .ok_or(BackendError::OutOfRange {
                offset: 0,
                len: usize::MAX,
                size: 0,
            })?;
        let handle = BufferHandle::from_raw(self.next_raw());
        state.buffers.insert(handle, vec![0; size]);
        Ok(handle)
    }

    async fn buffer_read(
        &self,
        handle: BufferHandle,
        destination: &mut [u8],
        element_count: usize,
        element_offset: usize,
        data_type: DataType,
    ) -> BackendResult<()> {
        self.read_now(handle, destination, element_count, element_offset, data_type)
    }

    fn buffer_write(
        &self,
        handle: BufferHandle,
        source: &[u8],
        element_count: usize,
        data_type: DataType,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("buffer_write")?;
        let data = state
            .buffers
            .get_mut(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))?;
        let range = Self::byte_range(data_type, 0, element_count, data.len())?;
        let len = range.len();
        if source.len() < len {
            return Err(BackendError::Transfer(format!(
                "source holds {} bytes, {} required",
                source.len(),
                len
            )));
        }
        data[range].copy_from_slice(&source[..len]);
        Ok(())
    }

    fn buffer_destroy(&self, handle: BufferHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("buffer_destroy")?;
        state
            .buffers
            .remove(&handle)
            .map(|_| ())
            .ok_or(BackendError::UnknownBuffer(handle))
    }

    fn create_shader(&self) -> BackendResult<ShaderHandle> {
        let mut state = self.state.lock();
        state.check("create_shader")?;
        let handle = ShaderHandle::from_raw(self.next_raw());
        state.shaders.insert(handle, HostShader::default());
        Ok(handle)
    }

    fn shader_load_kernel(&self, handle: ShaderHandle, source: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("shader_load_kernel")?;
        let shader = state
            .shaders
            .get_mut(&handle)
            .ok_or(BackendError::UnknownShader(handle))?;
        if source.trim().is_empty() {
            return Err(BackendError::Compilation("empty kernel source".into()));
        }
        shader.source = Some(source.to_string());
        shader.bindings.clear();
        self.compile_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shader_has_kernel(&self, handle: ShaderHandle) -> bool {
        self.state
            .lock()
            .shaders
            .get(&handle)
            .is_some_and(|s| s.source.is_some())
    }

    fn shader_set_buffer(
        &self,
        handle: ShaderHandle,
        index: u32,
        buffer: BufferHandle,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("shader_set_buffer")?;
        if !state.buffers.contains_key(&buffer) {
            return Err(BackendError::UnknownBuffer(buffer));
        }
        let shader = state
            .shaders
            .get_mut(&handle)
            .ok_or(BackendError::UnknownShader(handle))?;
        shader.bindings.insert(index, buffer);
        Ok(())
    }

    fn shader_clear_bindings(&self, handle: ShaderHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("shader_clear_bindings")?;
        let shader = state
            .shaders
            .get_mut(&handle)
            .ok_or(BackendError::UnknownShader(handle))?;
        shader.bindings.clear();
        Ok(())
    }

    async fn shader_dispatch(
        &self,
        handle: ShaderHandle,
        groups: WorkgroupCount,
    ) -> BackendResult<()> {
        self.dispatch_now(handle, groups)
    }

    fn shader_destroy(&self, handle: ShaderHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check("shader_destroy")?;
        state
            .shaders
            .remove(&handle)
            .map(|_| ())
            .ok_or(BackendError::UnknownShader(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready() -> HostBackend {
        let backend = HostBackend::new();
        backend.initialize_context().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_requires_initialized_context() {
        let backend = HostBackend::new();
        let err = backend.create_buffer(4, DataType::Float32).unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized));
    }

    #[tokio::test]
    async fn test_write_then_read_offset() {
        let backend = ready().await;
        let buffer = backend.create_buffer(4, DataType::Uint32).unwrap();
        let source: Vec<u8> = [10u32, 20, 30, 40]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        backend
            .buffer_write(buffer, &source, 4, DataType::Uint32)
            .unwrap();

        let mut out = [0u8; 8];
        backend
            .buffer_read(buffer, &mut out, 2, 1, DataType::Uint32)
            .await
            .unwrap();
        assert_eq!(&out[..4], &20u32.to_ne_bytes());
        assert_eq!(&out[4..], &30u32.to_ne_bytes());
    }

    #[tokio::test]
    async fn test_read_out_of_range() {
        let backend = ready().await;
        let buffer = backend.create_buffer(4, DataType::Float32).unwrap();
        let mut out = [0u8; 16];
        let err = backend
            .buffer_read(buffer, &mut out, 4, 1, DataType::Float32)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_without_kernel() {
        let backend = ready().await;
        let shader = backend.create_shader().unwrap();
        let err = backend
            .shader_dispatch(shader, WorkgroupCount::new(1, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NoKernel(_)));
    }

    #[tokio::test]
    async fn test_compile_count_and_dispatch_record() {
        let backend = ready().await;
        let shader = backend.create_shader().unwrap();
        let buffer = backend.create_buffer(1, DataType::Int32).unwrap();
        backend.shader_load_kernel(shader, "kernel").unwrap();
        backend.shader_set_buffer(shader, 0, buffer).unwrap();
        backend
            .shader_dispatch(shader, WorkgroupCount::new(2, 1, 1))
            .await
            .unwrap();

        assert_eq!(backend.compile_count(), 1);
        let dispatches = backend.dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].bindings, vec![(0, buffer)]);
        assert_eq!(dispatches[0].groups.x, 2);
    }

    #[tokio::test]
    async fn test_clear_bindings_keeps_kernel() {
        let backend = ready().await;
        let shader = backend.create_shader().unwrap();
        let a = backend.create_buffer(1, DataType::Int32).unwrap();
        let b = backend.create_buffer(1, DataType::Int32).unwrap();
        backend.shader_load_kernel(shader, "kernel").unwrap();
        backend.shader_set_buffer(shader, 0, a).unwrap();
        backend.shader_set_buffer(shader, 1, b).unwrap();

        backend.shader_clear_bindings(shader).unwrap();
        backend.shader_set_buffer(shader, 0, b).unwrap();
        backend
            .shader_dispatch(shader, WorkgroupCount::new(1, 1, 1))
            .await
            .unwrap();

        assert!(backend.shader_has_kernel(shader));
        assert_eq!(backend.compile_count(), 1);
        assert_eq!(backend.dispatches()[0].bindings, vec![(0, b)]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = ready().await;
        backend.fail_on("create_shader");
        assert!(matches!(
            backend.create_shader(),
            Err(BackendError::Injected("create_shader"))
        ));
        backend.clear_failures();
        assert!(backend.create_shader().is_ok());
    }

    #[tokio::test]
    async fn test_destroy_context_releases_everything() {
        let backend = ready().await;
        backend.create_buffer(8, DataType::Uint8).unwrap();
        backend.create_shader().unwrap();
        backend.destroy_context().unwrap();
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_shaders(), 0);
        assert!(!backend.is_initialized());
    }
}
