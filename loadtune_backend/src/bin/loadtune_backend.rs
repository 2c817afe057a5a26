use anyhow::{Context, Result};
use flume::unbounded;
use loadtune_backend::config::OptimizerConfig;
use loadtune_backend::runtime::BackendRuntime;
use loadtune_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,loadtune_backend=debug")),
        )
        .init();

    let config = OptimizerConfig::load();
    let (output_tx, output_rx) = unbounded();

    tracing::info!(
        "Starting standalone backend service (set LOADTUNE_BACKEND_TOKEN + optional LOADTUNE_BACKEND_BIND; auth mode via LOADTUNE_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let runtime = BackendRuntime::bootstrap(config, output_tx)
            .await
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, output_rx).await
    })
}
