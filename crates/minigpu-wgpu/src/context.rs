//! Device context that backs minigpu handles with wgpu resources.
//!
//! One [`WgpuBackend`] owns at most one device and queue at a time. Buffers
//! are storage buffers padded to [`wgpu::COPY_BUFFER_ALIGNMENT`]; host
//! transfers go through staging buffers and widen every copy to that
//! alignment. Kernels are WGSL compiled into compute pipelines with an
//! automatic layout, so only bindings the kernel actually uses in group 0
//! can be bound.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use minigpu_core::{
    BackendError, BackendResult, BufferHandle, ComputeBackend, DataType, ShaderHandle,
    WorkgroupCount,
};
use parking_lot::Mutex;

use crate::config::WgpuConfig;

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

struct GpuBuffer {
    buffer: Arc<wgpu::Buffer>,
    /// Logical size in bytes, before alignment padding
    size: u64,
}

#[derive(Default)]
struct GpuShader {
    pipeline: Option<Arc<wgpu::ComputePipeline>>,
    bindings: BTreeMap<u32, BufferHandle>,
}

struct DeviceState {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: wgpu::AdapterInfo,
    buffers: HashMap<BufferHandle, GpuBuffer>,
    shaders: HashMap<ShaderHandle, GpuShader>,
}

impl DeviceState {
    fn buffer(&self, handle: BufferHandle) -> BackendResult<&GpuBuffer> {
        self.buffers
            .get(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))
    }

    fn shader_mut(&mut self, handle: ShaderHandle) -> BackendResult<&mut GpuShader> {
        self.shaders
            .get_mut(&handle)
            .ok_or(BackendError::UnknownShader(handle))
    }
}

/// Compute backend on top of wgpu.
pub struct WgpuBackend {
    config: WgpuConfig,
    state: Mutex<Option<DeviceState>>,
    next_handle: AtomicU64,
}

impl WgpuBackend {
    /// Creates a backend with default adapter selection.
    pub fn new() -> Self {
        Self::with_config(WgpuConfig::default())
    }

    /// Creates a backend with explicit adapter and device settings.
    pub fn with_config(config: WgpuConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &WgpuConfig {
        &self.config
    }

    /// Returns information about the adapter in use, if a device is up.
    pub fn adapter_info(&self) -> Option<wgpu::AdapterInfo> {
        self.state.lock().as_ref().map(|state| state.info.clone())
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut DeviceState) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(BackendError::NotInitialized)?;
        f(state)
    }

    async fn request_device(&self) -> BackendResult<DeviceState> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: self.config.backends.into(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: self.config.power_preference.into(),
                compatible_surface: None,
                force_fallback_adapter: self.config.force_fallback_adapter,
            })
            .await
            .ok_or_else(|| BackendError::Unavailable("No wgpu adapter found".to_string()))?;

        let info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(&self.config.device_label),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| BackendError::Unavailable(format!("Failed to create device: {}", e)))?;

        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            tracing::error!("Uncaptured wgpu error: {}", error);
        }));

        tracing::info!(
            "Created wgpu device on {} ({:?}, {:?})",
            info.name,
            info.backend,
            info.device_type
        );

        Ok(DeviceState {
            device: Arc::new(device),
            queue: Arc::new(queue),
            info,
            buffers: HashMap::new(),
            shaders: HashMap::new(),
        })
    }
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` inside a validation error scope.
fn scoped<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> Result<T, wgpu::Error> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    match pollster::block_on(device.pop_error_scope()) {
        Some(error) => Err(error),
        None => Ok(value),
    }
}

/// Widens the byte range `offset..offset + len` to copy alignment.
/// Returns the aligned start and length.
fn aligned_span(offset: u64, len: u64) -> (u64, u64) {
    let start = offset - offset % ALIGN;
    let end = wgpu::util::align_to(offset + len, ALIGN);
    (start, end - start)
}

/// Copies an aligned range of `source` back to the host.
fn read_range(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    source: &wgpu::Buffer,
    offset: u64,
    size: u64,
) -> BackendResult<Vec<u8>> {
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("minigpu staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("minigpu readback"),
    });
    encoder.copy_buffer_to_buffer(source, offset, &staging, 0, size);
    let submission = queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::wait_for(submission));

    rx.recv()
        .map_err(|e| BackendError::Transfer(format!("Channel error: {}", e)))?
        .map_err(|e| BackendError::Transfer(format!("Map error: {}", e)))?;

    let bytes = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(bytes)
}

fn byte_len(data_type: DataType, elements: usize) -> BackendResult<u64> {
    data_type
        .byte_len(elements)
        .map(|len| len as u64)
        .ok_or(BackendError::OutOfRange {
            offset: 0,
            len: usize::MAX,
            size: 0,
        })
}

#[async_trait]
impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    async fn initialize_context(&self) -> BackendResult<()> {
        let state = self.request_device().await?;
        if self.state.lock().replace(state).is_some() {
            tracing::warn!("Replaced an existing wgpu device");
        }
        Ok(())
    }

    fn destroy_context(&self) -> BackendResult<()> {
        let state = self
            .state
            .lock()
            .take()
            .ok_or(BackendError::NotInitialized)?;
        for buffer in state.buffers.values() {
            buffer.buffer.destroy();
        }
        tracing::debug!(
            "Released wgpu device ({} buffers, {} shaders outstanding)",
            state.buffers.len(),
            state.shaders.len()
        );
        Ok(())
    }

    fn create_buffer(
        &self,
        element_count: usize,
        data_type: DataType,
    ) -> BackendResult<BufferHandle> {
        let size = byte_len(data_type, element_count)?;
        let handle = BufferHandle::from_raw(self.next_raw());

        self.with_state(|state| {
            let padded = wgpu::util::align_to(size.max(ALIGN), ALIGN);
            let limit = state.device.limits().max_buffer_size;
            if padded > limit {
                return Err(BackendError::Validation(format!(
                    "buffer of {} bytes exceeds device limit of {} bytes",
                    padded, limit
                )));
            }

            let device = Arc::clone(&state.device);
            let buffer = scoped(&device, || {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("minigpu buffer"),
                    size: padded,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .map_err(|e| BackendError::Validation(e.to_string()))?;

            state.buffers.insert(
                handle,
                GpuBuffer {
                    buffer: Arc::new(buffer),
                    size,
                },
            );
            Ok(handle)
        })
    }

    async fn buffer_read(
        &self,
        handle: BufferHandle,
        destination: &mut [u8],
        element_count: usize,
        element_offset: usize,
        data_type: DataType,
    ) -> BackendResult<()> {
        let offset = byte_len(data_type, element_offset)?;
        let len = byte_len(data_type, element_count)?;

        let (device, queue, buffer, size) = self.with_state(|state| {
            let gpu = state.buffer(handle)?;
            Ok((
                Arc::clone(&state.device),
                Arc::clone(&state.queue),
                Arc::clone(&gpu.buffer),
                gpu.size,
            ))
        })?;

        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(BackendError::OutOfRange {
                offset: offset as usize,
                len: len as usize,
                size: size as usize,
            });
        }
        if (destination.len() as u64) < len {
            return Err(BackendError::Transfer(format!(
                "destination holds {} bytes, {} required",
                destination.len(),
                len
            )));
        }
        if len == 0 {
            return Ok(());
        }

        let (start, span) = aligned_span(offset, len);
        let bytes = read_range(&device, &queue, &buffer, start, span)?;
        let skip = (offset - start) as usize;
        let len = len as usize;
        destination[..len].copy_from_slice(&bytes[skip..skip + len]);
        Ok(())
    }

    fn buffer_write(
        &self,
        handle: BufferHandle,
        source: &[u8],
        element_count: usize,
        data_type: DataType,
    ) -> BackendResult<()> {
        let len = byte_len(data_type, element_count)?;

        self.with_state(|state| {
            let gpu = state.buffer(handle)?;
            if len > gpu.size {
                return Err(BackendError::OutOfRange {
                    offset: 0,
                    len: len as usize,
                    size: gpu.size as usize,
                });
            }
            if (source.len() as u64) < len {
                return Err(BackendError::Transfer(format!(
                    "source holds {} bytes, {} required",
                    source.len(),
                    len
                )));
            }
            if len == 0 {
                return Ok(());
            }

            let len = len as usize;
            let tail = len % ALIGN as usize;
            if tail == 0 {
                state.queue.write_buffer(&gpu.buffer, 0, &source[..len]);
                return Ok(());
            }

            // Keep the bytes that share the last aligned word with the upload.
            let word_start = (len - tail) as u64;
            let existing = read_range(&state.device, &state.queue, &gpu.buffer, word_start, ALIGN)?;
            let mut padded = Vec::with_capacity(len - tail + ALIGN as usize);
            padded.extend_from_slice(&source[..len]);
            padded.extend_from_slice(&existing[tail..]);
            state.queue.write_buffer(&gpu.buffer, 0, &padded);
            Ok(())
        })
    }

    fn buffer_destroy(&self, handle: BufferHandle) -> BackendResult<()> {
        self.with_state(|state| {
            let gpu = state
                .buffers
                .remove(&handle)
                .ok_or(BackendError::UnknownBuffer(handle))?;
            gpu.buffer.destroy();
            Ok(())
        })
    }

    fn create_shader(&self) -> BackendResult<ShaderHandle> {
        let handle = ShaderHandle::from_raw(self.next_raw());
        self.with_state(|state| {
            state.shaders.insert(handle, GpuShader::default());
            Ok(handle)
        })
    }

    fn shader_load_kernel(&self, handle: ShaderHandle, source: &str) -> BackendResult<()> {
        let entry_point = self.config.entry_point.as_str();
        self.with_state(|state| {
            let device = Arc::clone(&state.device);
            let shader = state.shader_mut(handle)?;
            shader.pipeline = None;
            shader.bindings.clear();

            let pipeline = scoped(&device, || {
                let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("minigpu kernel"),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some("minigpu pipeline"),
                    layout: None,
                    module: &module,
                    entry_point: Some(entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .map_err(|e| BackendError::Compilation(e.to_string()))?;

            shader.pipeline = Some(Arc::new(pipeline));
            Ok(())
        })
    }

    fn shader_has_kernel(&self, handle: ShaderHandle) -> bool {
        self.state
            .lock()
            .as_ref()
            .and_then(|state| state.shaders.get(&handle))
            .is_some_and(|shader| shader.pipeline.is_some())
    }

    fn shader_set_buffer(
        &self,
        handle: ShaderHandle,
        index: u32,
        buffer: BufferHandle,
    ) -> BackendResult<()> {
        self.with_state(|state| {
            state.buffer(buffer)?;
            state.shader_mut(handle)?.bindings.insert(index, buffer);
            Ok(())
        })
    }

    fn shader_clear_bindings(&self, handle: ShaderHandle) -> BackendResult<()> {
        self.with_state(|state| {
            state.shader_mut(handle)?.bindings.clear();
            Ok(())
        })
    }

    async fn shader_dispatch(
        &self,
        handle: ShaderHandle,
        groups: WorkgroupCount,
    ) -> BackendResult<()> {
        let (device, queue, pipeline, bindings) = self.with_state(|state| {
            let shader = state
                .shaders
                .get(&handle)
                .ok_or(BackendError::UnknownShader(handle))?;
            let pipeline = shader
                .pipeline
                .clone()
                .ok_or(BackendError::NoKernel(handle))?;
            let bindings = shader
                .bindings
                .iter()
                .map(|(index, buffer)| {
                    state
                        .buffer(*buffer)
                        .map(|gpu| (*index, Arc::clone(&gpu.buffer)))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            Ok((
                Arc::clone(&state.device),
                Arc::clone(&state.queue),
                pipeline,
                bindings,
            ))
        })?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let submission = {
            let layout = pipeline.get_bind_group_layout(0);
            let entries: Vec<wgpu::BindGroupEntry> = bindings
                .iter()
                .map(|(index, buffer)| wgpu::BindGroupEntry {
                    binding: *index,
                    resource: buffer.as_entire_binding(),
                })
                .collect();
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("minigpu bindings"),
                layout: &layout,
                entries: &entries,
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("minigpu dispatch"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("minigpu compute pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups.x, groups.y, groups.z);
            }
            queue.submit(Some(encoder.finish()))
        };
        if let Some(error) = device.pop_error_scope().await {
            return Err(BackendError::Validation(error.to_string()));
        }

        device.poll(wgpu::Maintain::wait_for(submission));
        Ok(())
    }

    fn shader_destroy(&self, handle: ShaderHandle) -> BackendResult<()> {
        self.with_state(|state| {
            state
                .shaders
                .remove(&handle)
                .map(|_| ())
                .ok_or(BackendError::UnknownShader(handle))
        })
    }
}
