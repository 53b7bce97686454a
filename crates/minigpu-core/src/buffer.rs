//! Device buffers with validity tracking and bounds-checked transfers.

use std::sync::Arc;

use bytemuck::Pod;
use uuid::Uuid;

use crate::context::ContextShared;
use crate::error::{GpuError, Result};
use crate::types::{BufferHandle, DataType};

/// A device-memory buffer.
///
/// The buffer owns its native handle until [`Buffer::destroy`] runs or the
/// value is dropped, whichever comes first. Both paths release the handle
/// exactly once.
pub struct Buffer {
    context: Arc<ContextShared>,
    session: Uuid,
    handle: Option<BufferHandle>,
    element_count: usize,
    data_type: DataType,
}

impl Buffer {
    pub(crate) fn new(
        context: Arc<ContextShared>,
        element_count: usize,
        data_type: DataType,
    ) -> Result<Self> {
        let session = context.require_session()?;
        if data_type.byte_len(element_count).is_none() {
            return Err(GpuError::InvalidArgument(format!(
                "{element_count} elements of {data_type} overflow the address space"
            )));
        }
        let handle = context
            .backend()
            .create_buffer(element_count, data_type)
            .map_err(GpuError::platform("create_buffer"))?;
        context.track_buffer();
        tracing::debug!(
            "Created buffer {} ({} x {})",
            handle.raw(),
            element_count,
            data_type
        );

        Ok(Self {
            context,
            session,
            handle: Some(handle),
            element_count,
            data_type,
        })
    }

    /// Number of elements the buffer was created for.
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Element type the buffer was created for.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Capacity in bytes.
    pub fn byte_size(&self) -> usize {
        self.element_count * self.data_type.byte_width()
    }

    /// True until the buffer is destroyed or its context session ends.
    pub fn is_valid(&self) -> bool {
        self.handle.is_some() && self.context.is_current(self.session)
    }

    pub(crate) fn live_handle(&self) -> Result<BufferHandle> {
        let handle = self
            .handle
            .ok_or_else(|| GpuError::InvalidState("buffer has been destroyed".into()))?;
        self.context.check_session(self.session)?;
        Ok(handle)
    }

    /// Returns the native handle for binding into a shader of `context`.
    pub(crate) fn bind_handle(&self, context: &Arc<ContextShared>) -> Result<BufferHandle> {
        let handle = self.live_handle()?;
        if !Arc::ptr_eq(&self.context, context) {
            return Err(GpuError::InvalidArgument(
                "buffer belongs to a different context".into(),
            ));
        }
        Ok(handle)
    }

    /// Validates a transfer of `element_count` elements of `data_type` at
    /// `element_offset` against the host slice length and device capacity.
    fn check_transfer<T: Pod>(
        &self,
        host_len: usize,
        element_count: usize,
        element_offset: usize,
        data_type: DataType,
    ) -> Result<()> {
        if std::mem::size_of::<T>() != data_type.byte_width() {
            return Err(GpuError::InvalidArgument(format!(
                "host element size {} does not match {} ({} bytes)",
                std::mem::size_of::<T>(),
                data_type,
                data_type.byte_width()
            )));
        }
        if host_len < element_count {
            return Err(GpuError::InvalidArgument(format!(
                "host slice holds {host_len} elements, {element_count} requested"
            )));
        }

        let out_of_bounds = || GpuError::OutOfBounds {
            offset: element_offset,
            count: element_count,
            capacity: self.byte_size() / data_type.byte_width(),
        };
        let end = element_offset
            .checked_add(element_count)
            .and_then(|end| data_type.byte_len(end))
            .ok_or_else(out_of_bounds)?;
        if end > self.byte_size() {
            return Err(out_of_bounds());
        }
        Ok(())
    }

    /// Copies `element_count` elements of `data_type`, starting at
    /// `element_offset`, from the device into `destination`.
    pub async fn read<T: Pod>(
        &self,
        destination: &mut [T],
        element_count: usize,
        element_offset: usize,
        data_type: DataType,
    ) -> Result<()> {
        let handle = self.live_handle()?;
        self.check_transfer::<T>(destination.len(), element_count, element_offset, data_type)?;

        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut destination[..element_count]);
        self.context
            .backend()
            .buffer_read(handle, bytes, element_count, element_offset, data_type)
            .await
            .map_err(GpuError::platform("buffer_read"))
    }

    /// Reads the whole buffer as its declared data type.
    pub async fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); self.element_count];
        self.read(&mut out, self.element_count, 0, self.data_type)
            .await?;
        Ok(out)
    }

    /// Blocking form of [`Buffer::read`] for callers outside an async runtime.
    pub fn read_blocking<T: Pod>(
        &self,
        destination: &mut [T],
        element_count: usize,
        element_offset: usize,
        data_type: DataType,
    ) -> Result<()> {
        pollster::block_on(self.read(destination, element_count, element_offset, data_type))
    }

    /// Blocking form of [`Buffer::to_vec`].
    pub fn to_vec_blocking<T: Pod>(&self) -> Result<Vec<T>> {
        pollster::block_on(self.to_vec())
    }

    /// Uploads `element_count` elements of `data_type` from `source` to the
    /// start of the buffer.
    pub fn write<T: Pod>(&self, source: &[T], element_count: usize, data_type: DataType) -> Result<()> {
        let handle = self.live_handle()?;
        self.check_transfer::<T>(source.len(), element_count, 0, data_type)?;

        let bytes: &[u8] = bytemuck::cast_slice(&source[..element_count]);
        self.context
            .backend()
            .buffer_write(handle, bytes, element_count, data_type)
            .map_err(GpuError::platform("buffer_write"))
    }

    /// Releases the native buffer. Later calls do nothing.
    pub fn destroy(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // A previous session's handles went away with its native context.
        if !self.context.is_current(self.session) {
            return;
        }
        if let Err(e) = self.context.backend().buffer_destroy(handle) {
            tracing::warn!("Failed to release buffer {}: {}", handle.raw(), e);
        }
        self.context.untrack_buffer();
        tracing::debug!("Destroyed buffer {}", handle.raw());
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("element_count", &self.element_count)
            .field("data_type", &self.data_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContextManager;
    use crate::backend::HostBackend;
    use approx::assert_relative_eq;

    async fn context() -> (Arc<HostBackend>, ContextManager) {
        let backend = Arc::new(HostBackend::new());
        let mut ctx = ContextManager::new(backend.clone());
        ctx.init().await.unwrap();
        (backend, ctx)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_, ctx) = context().await;
        let buffer = ctx.create_buffer(4, DataType::Float32).unwrap();
        buffer
            .write(&[1.0f32, 2.0, 3.0, 4.0], 4, DataType::Float32)
            .unwrap();

        let out: Vec<f32> = buffer.to_vec().await.unwrap();
        for (got, want) in out.iter().zip([1.0f32, 2.0, 3.0, 4.0]) {
            assert_relative_eq!(*got, want);
        }
    }

    #[tokio::test]
    async fn test_blocking_reads() {
        let (_, ctx) = context().await;
        let buffer = ctx.create_buffer(4, DataType::Int16).unwrap();
        buffer.write(&[-1i16, 2, -3, 4], 4, DataType::Int16).unwrap();

        let mut tail = [0i16; 2];
        buffer.read_blocking(&mut tail, 2, 2, DataType::Int16).unwrap();
        assert_eq!(tail, [-3, 4]);
        assert_eq!(buffer.to_vec_blocking::<i16>().unwrap(), vec![-1, 2, -3, 4]);
        assert!(matches!(
            buffer.read_blocking(&mut tail, 2, 3, DataType::Int16),
            Err(GpuError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_with_offset() {
        let (_, ctx) = context().await;
        let buffer = ctx.create_buffer(5, DataType::Int32).unwrap();
        buffer
            .write(&[5i32, 6, 7, 8, 9], 5, DataType::Int32)
            .unwrap();

        let mut out = [0i32; 2];
        buffer.read(&mut out, 2, 3, DataType::Int32).await.unwrap();
        assert_eq!(out, [8, 9]);
    }

    #[tokio::test]
    async fn test_read_out_of_bounds_never_reaches_backend() {
        let (backend, ctx) = context().await;
        backend.fail_on("buffer_read");
        let buffer = ctx.create_buffer(4, DataType::Float32).unwrap();

        let mut out = [0f32; 4];
        let err = buffer
            .read(&mut out, 4, 1, DataType::Float32)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::OutOfBounds {
                offset: 1,
                count: 4,
                capacity: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_offset_overflow_is_out_of_bounds() {
        let (_, ctx) = context().await;
        let buffer = ctx.create_buffer(4, DataType::Uint8).unwrap();
        let mut out = [0u8; 1];
        let err = buffer
            .read(&mut out, 1, usize::MAX, DataType::Uint8)
            .await
            .unwrap_err();
        assert!(matches!(err, GpuError::OutOfBounds { .. }));
    }

    #[tokio::test]
    async fn test_write_larger_than_capacity() {
        let (_, ctx) = context().await;
        let buffer = ctx.create_buffer(2, DataType::Uint16).unwrap();
        assert!(matches!(
            buffer.write(&[1u16, 2, 3], 3, DataType::Uint16),
            Err(GpuError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_mismatched_host_width() {
        let (_, ctx) = context().await;
        let buffer = ctx.create_buffer(4, DataType::Float32).unwrap();
        assert!(matches!(
            buffer.write(&[1.0f64], 1, DataType::Float32),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_short_host_slice() {
        let (_, ctx) = context().await;
        let buffer = ctx.create_buffer(4, DataType::Float32).unwrap();
        let mut out = [0f32; 2];
        assert!(matches!(
            buffer.read(&mut out, 3, 0, DataType::Float32).await,
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_use_after_destroy() {
        let (backend, ctx) = context().await;
        let mut buffer = ctx.create_buffer(4, DataType::Float32).unwrap();
        buffer.destroy();

        assert!(!buffer.is_valid());
        assert!(matches!(
            buffer.write(&[1.0f32], 1, DataType::Float32),
            Err(GpuError::InvalidState(_))
        ));
        let mut out = [0f32; 1];
        assert!(matches!(
            buffer.read(&mut out, 1, 0, DataType::Float32).await,
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(backend.live_buffers(), 0);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (backend, ctx) = context().await;
        let mut buffer = ctx.create_buffer(4, DataType::Float32).unwrap();
        let _other = ctx.create_buffer(1, DataType::Float32).unwrap();
        for _ in 0..3 {
            buffer.destroy();
        }
        drop(buffer);
        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(ctx.live_buffer_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_handle() {
        let (backend, ctx) = context().await;
        {
            let _buffer = ctx.create_buffer(16, DataType::Uint8).unwrap();
            assert_eq!(backend.live_buffers(), 1);
        }
        assert_eq!(backend.live_buffers(), 0);
    }

    #[tokio::test]
    async fn test_destroy_swallows_backend_failure() {
        let (backend, ctx) = context().await;
        let mut buffer = ctx.create_buffer(1, DataType::Int8).unwrap();
        backend.fail_on("buffer_destroy");
        buffer.destroy();
        buffer.destroy();
        assert!(!buffer.is_valid());
    }
}
