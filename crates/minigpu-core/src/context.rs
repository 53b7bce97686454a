//! GPU context lifecycle and resource factory.
//!
//! A [`ContextManager`] owns one backend context session. It hands out
//! [`Buffer`]s and [`CachedComputeShader`]s and owns the content-keyed cache
//! of compiled shaders, which it destroys before tearing the native context
//! down.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::backend::ComputeBackend;
use crate::buffer::Buffer;
use crate::config::ContextConfig;
use crate::error::{GpuError, Result};
use crate::shader::cache::{ContentKey, ShaderCache, SharedShader};
use crate::shader::{CachedComputeShader, ComputeShader};
use crate::types::DataType;

/// State shared between a context and every resource it created.
pub(crate) struct ContextShared {
    backend: Arc<dyn ComputeBackend>,
    config: ContextConfig,
    /// Current session id, `None` while uninitialized
    session: RwLock<Option<Uuid>>,
    cache: Mutex<ShaderCache>,
    live_buffers: AtomicUsize,
    live_shaders: AtomicUsize,
}

impl ContextShared {
    pub(crate) fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub(crate) fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Returns the current session, or `NotInitialized`.
    pub(crate) fn require_session(&self) -> Result<Uuid> {
        (*self.session.read()).ok_or(GpuError::NotInitialized)
    }

    pub(crate) fn is_current(&self, session: Uuid) -> bool {
        *self.session.read() == Some(session)
    }

    /// Checks that a resource created in `session` may still reach the backend.
    pub(crate) fn check_session(&self, session: Uuid) -> Result<()> {
        match *self.session.read() {
            None => Err(GpuError::NotInitialized),
            Some(current) if current == session => Ok(()),
            Some(_) => Err(GpuError::InvalidState(
                "resource belongs to a previous context session".into(),
            )),
        }
    }

    pub(crate) fn track_buffer(&self) {
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn untrack_buffer(&self) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn track_shader(&self) {
        self.live_shaders.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn untrack_shader(&self) {
        self.live_shaders.fetch_sub(1, Ordering::Relaxed);
    }

    /// Resolve the canonical compiled shader for `source`, compiling it on a
    /// cache miss.
    ///
    /// The cache lock is held across the compile so two callers racing on
    /// the same content key compile it once. The session is checked under
    /// that lock, which `ContextManager::destroy` holds for the whole
    /// teardown, so no entry can be inserted for a session that is ending.
    pub(crate) fn get_or_create_cached_shader(self: &Arc<Self>, source: &str) -> Result<SharedShader> {
        let key = ContentKey::of(source);
        let mut cache = self.cache.lock();
        self.require_session()?;

        if let Some(shader) = cache.get(&key).cloned() {
            let (valid, same_source) = {
                let guard = shader.lock();
                (guard.is_valid(), guard.source() == Some(source))
            };
            if !valid {
                tracing::warn!("Evicting invalid cached shader for {}", key);
                cache.remove(&key);
            } else if !self.config.verify_cached_source || same_source {
                tracing::debug!("Shader cache hit for {}", key);
                return Ok(shader);
            } else {
                tracing::error!(
                    "Content key collision for {}; compiling an uncached shader",
                    key
                );
                let mut fresh = ComputeShader::new(Arc::clone(self))?;
                fresh.load_kernel_string(source)?;
                return Ok(Arc::new(Mutex::new(fresh)));
            }
        }

        let mut shader = ComputeShader::new(Arc::clone(self))?;
        shader.load_kernel_string(source)?;
        let shared = Arc::new(Mutex::new(shader));
        cache.insert(key, Arc::clone(&shared));
        tracing::debug!(
            "Shader cache miss for {}; {} cached shaders",
            key,
            cache.len()
        );
        Ok(shared)
    }
}

/// Owner of one GPU context session.
///
/// The manager is the only way to create buffers and shaders. Dropping it
/// tears the context down if it is still initialized.
pub struct ContextManager {
    shared: Arc<ContextShared>,
}

impl ContextManager {
    /// Creates an uninitialized context manager over `backend`.
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self::with_config(backend, ContextConfig::default())
    }

    /// Creates an uninitialized context manager with explicit settings.
    pub fn with_config(backend: Arc<dyn ComputeBackend>, config: ContextConfig) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                backend,
                config,
                session: RwLock::new(None),
                cache: Mutex::new(ShaderCache::new()),
                live_buffers: AtomicUsize::new(0),
                live_shaders: AtomicUsize::new(0),
            }),
        }
    }

    /// Brings up the native context.
    pub async fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Err(GpuError::AlreadyInitialized);
        }
        self.shared
            .backend
            .initialize_context()
            .await
            .map_err(GpuError::platform("initialize_context"))?;

        let session = Uuid::new_v4();
        *self.shared.session.write() = Some(session);
        tracing::info!(
            "GPU context '{}' initialized on {} backend (session {})",
            self.shared.config.label,
            self.shared.backend.name(),
            session
        );
        Ok(())
    }

    /// Destroys every cached shader, then the native context.
    ///
    /// The manager is uninitialized afterwards even if the backend reports a
    /// teardown failure. The shader cache stays locked until the session is
    /// cleared.
    pub fn destroy(&mut self) -> Result<()> {
        let mut cache = self.shared.cache.lock();
        let session = self.shared.require_session()?;

        let cached = cache.drain();
        let cached_count = cached.len();
        for shader in cached {
            shader.lock().destroy();
        }

        let buffers = self.shared.live_buffers.swap(0, Ordering::Relaxed);
        let shaders = self.shared.live_shaders.swap(0, Ordering::Relaxed);
        if self.shared.config.warn_on_leaks && (buffers > 0 || shaders > 0) {
            tracing::warn!(
                "Destroying GPU context '{}' with {} live buffers and {} live shaders",
                self.shared.config.label,
                buffers,
                shaders
            );
        }

        let result = self.shared.backend.destroy_context();
        *self.shared.session.write() = None;
        drop(cache);
        tracing::info!(
            "GPU context '{}' destroyed (session {}, {} cached shaders released)",
            self.shared.config.label,
            session,
            cached_count
        );
        result.map_err(GpuError::platform("destroy_context"))
    }

    /// Returns true while the context is initialized.
    pub fn is_initialized(&self) -> bool {
        self.shared.session.read().is_some()
    }

    /// Returns the id of the current session.
    pub fn id(&self) -> Option<Uuid> {
        *self.shared.session.read()
    }

    /// Allocates a device buffer of `element_count` elements of `data_type`.
    pub fn create_buffer(&self, element_count: usize, data_type: DataType) -> Result<Buffer> {
        Buffer::new(Arc::clone(&self.shared), element_count, data_type)
    }

    /// Creates a compute shader whose compilation is shared by content.
    ///
    /// The wrapper owns no native object until its first load, so this never
    /// fails. The initialization check happens in `load_kernel_string`, which
    /// returns [`GpuError::NotInitialized`] before `init`.
    pub fn create_compute_shader(&self) -> CachedComputeShader {
        CachedComputeShader::new(Arc::clone(&self.shared))
    }

    /// Creates a compute shader with its own native handle, bypassing the cache.
    pub fn create_uncached_compute_shader(&self) -> Result<ComputeShader> {
        ComputeShader::new(Arc::clone(&self.shared))
    }

    /// Returns the number of canonical shaders in the cache.
    pub fn cached_shader_count(&self) -> usize {
        self.shared.cache.lock().len()
    }

    /// Returns the number of buffers created in this session and not yet destroyed.
    pub fn live_buffer_count(&self) -> usize {
        self.shared.live_buffers.load(Ordering::Relaxed)
    }

    /// Returns the backend this context drives.
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.shared.backend
    }

    /// Returns the context configuration.
    pub fn config(&self) -> &ContextConfig {
        self.shared.config()
    }
}

impl Drop for ContextManager {
    fn drop(&mut self) {
        if self.is_initialized()
            && let Err(e) = self.destroy()
        {
            tracing::warn!("Failed to destroy GPU context on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, NullBackend};

    fn host_context() -> (Arc<HostBackend>, ContextManager) {
        let backend = Arc::new(HostBackend::new());
        let ctx = ContextManager::new(backend.clone());
        (backend, ctx)
    }

    #[tokio::test]
    async fn test_double_init_fails() {
        let (_, mut ctx) = host_context();
        ctx.init().await.unwrap();
        assert!(matches!(ctx.init().await, Err(GpuError::AlreadyInitialized)));
        assert!(ctx.is_initialized());
    }

    #[tokio::test]
    async fn test_destroy_before_init_fails() {
        let (_, mut ctx) = host_context();
        assert!(matches!(ctx.destroy(), Err(GpuError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_create_buffer_before_init_fails() {
        let (backend, ctx) = host_context();
        assert!(matches!(
            ctx.create_buffer(4, DataType::Float32),
            Err(GpuError::NotInitialized)
        ));
        assert_eq!(backend.live_buffers(), 0);
    }

    #[tokio::test]
    async fn test_reinit_after_destroy() {
        let (_, mut ctx) = host_context();
        ctx.init().await.unwrap();
        let first = ctx.id();
        ctx.destroy().unwrap();
        assert!(!ctx.is_initialized());
        ctx.init().await.unwrap();
        assert_ne!(ctx.id(), first);
    }

    #[tokio::test]
    async fn test_destroy_clears_cache_first() {
        let (backend, mut ctx) = host_context();
        ctx.init().await.unwrap();
        let mut shader = ctx.create_compute_shader();
        shader.load_kernel_string("kernel a").unwrap();
        assert_eq!(ctx.cached_shader_count(), 1);
        assert_eq!(backend.live_shaders(), 1);

        ctx.destroy().unwrap();
        assert_eq!(ctx.cached_shader_count(), 0);
        assert!(!shader.has_kernel());
        assert!(matches!(
            shader.dispatch(1, 1, 1).await,
            Err(GpuError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_compute_shader_before_init_fails_on_load() {
        let (backend, ctx) = host_context();
        let mut shader = ctx.create_compute_shader();
        assert!(matches!(
            shader.load_kernel_string("kernel a"),
            Err(GpuError::NotInitialized)
        ));
        assert!(!shader.has_kernel());
        assert_eq!(ctx.cached_shader_count(), 0);
        assert_eq!(backend.live_shaders(), 0);
    }

    #[tokio::test]
    async fn test_load_after_destroy_leaves_cache_empty() {
        let (_, mut ctx) = host_context();
        ctx.init().await.unwrap();
        ctx.destroy().unwrap();

        let mut shader = ctx.create_compute_shader();
        assert!(matches!(
            shader.load_kernel_string("kernel a"),
            Err(GpuError::NotInitialized)
        ));
        assert_eq!(ctx.cached_shader_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_cache_entry_is_evicted() {
        let (backend, mut ctx) = host_context();
        ctx.init().await.unwrap();
        let mut previous = ctx.create_uncached_compute_shader().unwrap();
        previous.load_kernel_string("kernel a").unwrap();
        ctx.destroy().unwrap();
        ctx.init().await.unwrap();

        // An entry from an ended session left behind in the cache.
        ctx.shared
            .cache
            .lock()
            .insert(ContentKey::of("kernel a"), Arc::new(Mutex::new(previous)));

        let mut shader = ctx.create_compute_shader();
        shader.load_kernel_string("kernel a").unwrap();
        assert!(shader.has_kernel());
        assert!(shader.is_valid());
        assert_eq!(ctx.cached_shader_count(), 1);
        assert_eq!(backend.compile_count(), 2);
    }

    #[tokio::test]
    async fn test_init_failure_is_platform_error() {
        let mut ctx = ContextManager::new(Arc::new(NullBackend));
        let err = ctx.init().await.unwrap_err();
        assert!(matches!(
            err,
            GpuError::Platform {
                operation: "initialize_context",
                ..
            }
        ));
        assert!(!ctx.is_initialized());
    }

    #[tokio::test]
    async fn test_drop_tears_down_context() {
        let (backend, mut ctx) = host_context();
        ctx.init().await.unwrap();
        let buffer = ctx.create_buffer(2, DataType::Int32).unwrap();
        drop(buffer);
        drop(ctx);
        assert!(!backend.is_initialized());
    }

    #[tokio::test]
    async fn test_stale_resources_after_teardown() {
        let (backend, mut ctx) = host_context();
        ctx.init().await.unwrap();
        let buffer = ctx.create_buffer(2, DataType::Int32).unwrap();
        ctx.destroy().unwrap();
        ctx.init().await.unwrap();

        assert!(!buffer.is_valid());
        assert!(matches!(
            buffer.write(&[1i32, 2], 2, DataType::Int32),
            Err(GpuError::InvalidState(_))
        ));
        drop(buffer);
        assert_eq!(ctx.live_buffer_count(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }
}
