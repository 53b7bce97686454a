//! minigpu CLI
//!
//! Brings up a GPU context and runs a kernel over an `i32` buffer.
//!
//! ```bash
//! # Add one to 4096 integers on the default adapter
//! minigpu --count 4096
//!
//! # Exercise the lifecycle without a device
//! minigpu --host
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use minigpu_core::convert::{self, WORKGROUP_SIZE};
use minigpu_core::{ComputeBackend, ContextManager, DataType, HostBackend};
use minigpu_wgpu::WgpuBackend;

mod config;

use config::CliConfig;

/// Run a compute kernel through minigpu
#[derive(Parser)]
#[command(name = "minigpu")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (RON)
    #[arg(short, long, default_value = "minigpu.ron")]
    config: PathBuf,

    /// Use the host backend instead of wgpu
    #[arg(long)]
    host: bool,

    /// Number of elements to process
    #[arg(short = 'n', long, default_value_t = 1024)]
    count: usize,

    /// WGSL kernel binding a single `data` array at binding 0
    #[arg(short, long)]
    kernel: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "minigpu=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let backend: Arc<dyn ComputeBackend> = if cli.host {
        Arc::new(HostBackend::new())
    } else {
        Arc::new(WgpuBackend::with_config(config.wgpu.clone()))
    };

    let mut ctx = ContextManager::with_config(backend, config.context.clone());
    ctx.init().await.context("failed to initialize GPU context")?;

    let result = run(&ctx, &cli).await;
    ctx.destroy().context("failed to destroy GPU context")?;
    result
}

async fn run(ctx: &ContextManager, cli: &Cli) -> Result<()> {
    let count = cli.count;
    let input: Vec<i32> = (0..count as i32).collect();

    let data = ctx.create_buffer(count, DataType::Int32)?;
    data.write(&input, count, DataType::Int32)?;

    let groups = (count as u32).div_ceil(WORKGROUP_SIZE);
    match &cli.kernel {
        Some(path) => {
            let mut shader = ctx.create_compute_shader();
            shader.load_kernel_file(path)?;
            shader.set_buffer("data", &data)?;
            shader.dispatch(groups, 1, 1).await?;
        }
        None => convert::add_one_i32(ctx, &data).await?,
    }

    let output: Vec<i32> = data.to_vec().await?;
    let changed = input
        .iter()
        .zip(&output)
        .filter(|(before, after)| before != after)
        .count();

    tracing::info!(
        "Dispatched {} workgroups on {} backend; {} of {} elements changed",
        groups,
        ctx.backend().name(),
        changed,
        count
    );
    if let (Some(first), Some(last)) = (output.first(), output.last()) {
        println!("data[0] = {}, data[{}] = {}", first, count - 1, last);
    }
    Ok(())
}
