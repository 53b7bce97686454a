//! End-to-end lifecycle scenarios against the host backend.

use std::sync::{Arc, Barrier};

use approx::assert_relative_eq;
use minigpu_core::{CachedComputeShader, ContextManager, DataType, GpuError, HostBackend};

async fn initialized() -> (Arc<HostBackend>, ContextManager) {
    let backend = Arc::new(HostBackend::new());
    let mut ctx = ContextManager::new(backend.clone());
    ctx.init().await.unwrap();
    (backend, ctx)
}

#[tokio::test]
async fn test_float_buffer_roundtrip() {
    let (_, ctx) = initialized().await;
    let buffer = ctx.create_buffer(4, DataType::Float32).unwrap();
    buffer
        .write(&[1.0f32, 2.0, 3.0, 4.0], 4, DataType::Float32)
        .unwrap();

    let mut out = [0f32; 4];
    buffer.read(&mut out, 4, 0, DataType::Float32).await.unwrap();
    for (got, want) in out.iter().zip([1.0f32, 2.0, 3.0, 4.0]) {
        assert_relative_eq!(*got, want);
    }
}

#[tokio::test]
async fn test_cached_shaders_compile_once() {
    let (backend, ctx) = initialized().await;
    let mut first = ctx.create_compute_shader();
    let mut second = ctx.create_compute_shader();
    first.load_kernel_string("K1 source").unwrap();
    second.load_kernel_string("K1 source").unwrap();

    assert_eq!(backend.compile_count(), 1);
    assert!(first.shares_kernel_with(&second));
}

#[tokio::test]
async fn test_concurrent_loads_compile_once() {
    const THREADS: usize = 8;
    let (backend, ctx) = initialized().await;
    let barrier = Barrier::new(THREADS);

    let shaders: Vec<CachedComputeShader> = std::thread::scope(|scope| {
        let ctx = &ctx;
        let barrier = &barrier;
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(move || {
                    let mut shader = ctx.create_compute_shader();
                    barrier.wait();
                    shader.load_kernel_string("K1 source").unwrap();
                    shader
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect()
    });

    assert_eq!(backend.compile_count(), 1);
    assert_eq!(ctx.cached_shader_count(), 1);
    assert_eq!(backend.live_shaders(), 1);
    assert!(shaders.iter().all(|shader| shader.shares_kernel_with(&shaders[0])));
}

#[tokio::test]
async fn test_binding_indices() {
    let (_, ctx) = initialized().await;
    let buf_a = ctx.create_buffer(8, DataType::Float32).unwrap();
    let buf_b = ctx.create_buffer(8, DataType::Float32).unwrap();
    let buf_c = ctx.create_buffer(8, DataType::Float32).unwrap();

    let mut shader = ctx.create_uncached_compute_shader().unwrap();
    shader.load_kernel_string("K1 source").unwrap();
    let indices = [
        shader.set_buffer("in", &buf_a).unwrap(),
        shader.set_buffer("out", &buf_b).unwrap(),
        shader.set_buffer("in", &buf_c).unwrap(),
    ];
    assert_eq!(indices, [0, 1, 0]);
}

#[tokio::test]
async fn test_init_destroy_sequence() {
    let backend = Arc::new(HostBackend::new());
    let mut ctx = ContextManager::new(backend.clone());

    assert!(matches!(ctx.destroy(), Err(GpuError::NotInitialized)));
    assert!(matches!(
        ctx.create_uncached_compute_shader(),
        Err(GpuError::NotInitialized)
    ));

    for _ in 0..3 {
        ctx.init().await.unwrap();
        assert!(matches!(ctx.init().await, Err(GpuError::AlreadyInitialized)));
        ctx.destroy().unwrap();
        assert!(matches!(ctx.destroy(), Err(GpuError::NotInitialized)));
    }
    assert!(!backend.is_initialized());
}

#[tokio::test]
async fn test_reload_restarts_numbering_on_shared_kernel() {
    let (backend, ctx) = initialized().await;
    let a = ctx.create_buffer(4, DataType::Uint32).unwrap();
    let b = ctx.create_buffer(4, DataType::Uint32).unwrap();

    let mut producer = ctx.create_compute_shader();
    producer.load_kernel_string("K1 source").unwrap();
    producer.set_buffer("a", &a).unwrap();
    producer.set_buffer("b", &b).unwrap();

    let mut consumer = ctx.create_compute_shader();
    consumer.load_kernel_string("K1 source").unwrap();
    assert_eq!(consumer.set_buffer("b", &b).unwrap(), 0);
    assert_eq!(backend.compile_count(), 1);
}

#[tokio::test]
async fn test_dispatch_records_bindings_in_index_order() {
    let (backend, ctx) = initialized().await;
    let input = ctx.create_buffer(64, DataType::Float32).unwrap();
    let output = ctx.create_buffer(64, DataType::Float32).unwrap();

    let mut shader = ctx.create_compute_shader();
    shader.load_kernel_string("K1 source").unwrap();
    shader.set_buffer("input", &input).unwrap();
    shader.set_buffer("output", &output).unwrap();
    shader.dispatch(1, 1, 1).await.unwrap();

    let dispatch = &backend.dispatches()[0];
    let indices: Vec<u32> = dispatch.bindings.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test]
async fn test_teardown_with_outstanding_resources() {
    let (backend, mut ctx) = initialized().await;
    let mut buffer = ctx.create_buffer(4, DataType::Float32).unwrap();
    let mut standalone = ctx.create_uncached_compute_shader().unwrap();
    let mut cached = ctx.create_compute_shader();
    cached.load_kernel_string("K1 source").unwrap();

    ctx.destroy().unwrap();
    assert!(!buffer.is_valid());
    assert!(!standalone.is_valid());
    assert!(!cached.has_kernel());

    // Explicit destroy after teardown is still silent.
    buffer.destroy();
    standalone.destroy();
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.live_shaders(), 0);
}

#[tokio::test]
async fn test_independent_contexts_coexist() {
    let (backend_a, ctx_a) = initialized().await;
    let (backend_b, ctx_b) = initialized().await;

    let mut a = ctx_a.create_compute_shader();
    let mut b = ctx_b.create_compute_shader();
    a.load_kernel_string("K1 source").unwrap();
    b.load_kernel_string("K1 source").unwrap();

    assert_eq!(backend_a.compile_count(), 1);
    assert_eq!(backend_b.compile_count(), 1);
    assert!(!a.shares_kernel_with(&b));
    assert_ne!(ctx_a.id(), ctx_b.id());
}
