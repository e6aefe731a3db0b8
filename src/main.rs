use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ripd::api::server::{ApiServer, ApiServerConfig, AppState};
use ripd::config::Config;
use ripd::pipeline::extraction::{ExtractionPipeline, PipelineConfig};
use ripd::pipeline::retention::RetentionSweeper;
use ripd::pipeline::scheduler::{JobScheduler, SchedulerConfig};
use ripd::runner::{ProcessToolRunner, ToolRunner, detect_version};
use ripd::workspace::WorkspaceManager;
use ripd::{logging, Result};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env_or_default());

    // Keep the guard alive for the process lifetime.
    let _log_guard = logging::init_logging(&config.log_dir)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ripd");

    let shutdown = CancellationToken::new();
    let state = build_state(&config, &shutdown)?;

    logging::start_retention_cleanup(config.log_dir.clone(), shutdown.clone());

    let server = ApiServer::new(
        ApiServerConfig::from_env_or_default(),
        state,
        shutdown.clone(),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c, shutting down");
                shutdown.cancel();
            }
        }
    });

    server.run().await?;
    info!("ripd stopped");
    Ok(())
}

/// Wire up the pipeline services and background tasks.
fn build_state(config: &Arc<Config>, shutdown: &CancellationToken) -> Result<AppState> {
    let extractor_version = detect_version(&config.extractor_path, "--version");
    let transcoder_version = detect_version(&config.transcoder_path, "-version");
    match &extractor_version {
        Some(version) => info!(path = %config.extractor_path, version, "Extractor detected"),
        None => warn!(path = %config.extractor_path, "Extractor not found; extractions will fail"),
    }
    match &transcoder_version {
        Some(version) => info!(path = %config.transcoder_path, version, "Transcoder detected"),
        None => warn!(path = %config.transcoder_path, "Transcoder not found; transcodes will fail"),
    }

    let workspaces = Arc::new(WorkspaceManager::new(
        config.workspace_root.clone(),
        config.min_free_bytes,
    ));
    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessToolRunner::new(config.kill_grace));
    let pipeline = Arc::new(ExtractionPipeline::new(
        runner.clone(),
        workspaces.clone(),
        PipelineConfig::from_config(config)?,
    ));
    let scheduler = Arc::new(JobScheduler::new(
        SchedulerConfig::from_config(config),
        pipeline,
        shutdown.clone(),
    ));

    let sweeper = Arc::new(RetentionSweeper::new(
        scheduler.registry().clone(),
        workspaces,
        config.retention,
    ));
    sweeper.start(shutdown.clone());

    Ok(AppState::new(config.clone(), scheduler, runner)
        .with_tool_versions(extractor_version, transcoder_version))
}
