mod cli;
mod query;
mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pdbsim_core::config::{ServiceConfig, ensure_service_config, ensure_service_config_at};
use pdbsim_engine::{
    BackendConfig, Collaborators, CommandVisualizer, EngineConfig, ExternalAligner, HttpBackend,
    InMemoryJobRegistry, JobStatus, MemoryStore, SearchEngine, SearchRequest, Visualizer,
};

use crate::cli::Cli;
use crate::query::resolve_query;
use crate::shutdown::{InterruptCounter, ShutdownEvent, spawn_ctrl_c_handler};

const DEFAULT_ALIGNER: &str = "pdbsim-align";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut cfg = match &cli.config {
        Some(path) => ensure_service_config_at(path)
            .with_context(|| format!("config {}", path.display()))?,
        None => match ensure_service_config() {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("failed to read/write service config, using defaults: {err:#}");
                ServiceConfig::default()
            }
        },
    };
    if let Some(url) = &cli.backend_url {
        cfg.backend_url = url.to_string();
    }
    if let Some(store) = &cli.store {
        cfg.store_snapshot = Some(store.clone());
    }
    cfg.normalize();
    Ok(cfg)
}

fn build_visualizer(cfg: &ServiceConfig) -> Option<Arc<dyn Visualizer>> {
    let tools = &cfg.tools;
    match (&tools.pymol, &tools.convert, &tools.draw_script) {
        (Some(pymol), Some(convert), Some(draw_script)) => Some(Arc::new(CommandVisualizer {
            pymol: PathBuf::from(pymol),
            convert: PathBuf::from(convert),
            draw_script: draw_script.clone(),
            raw_pdbs: cfg.dirs.raw_pdbs.clone(),
        })),
        _ => {
            info!("pymol, convert or draw script not configured; comparison images disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let service = load_config(&cli)?;

    let store = Arc::new(match &service.store_snapshot {
        Some(path) => MemoryStore::load(path)?,
        None => MemoryStore::new(),
    });
    let backend = HttpBackend::new(BackendConfig::from_service(&service)?, store.clone())?;
    let aligner = ExternalAligner::new(
        service.tools.aligner.as_deref().unwrap_or(DEFAULT_ALIGNER),
        service.dirs.archive.clone(),
    );
    let visualizer = if cli.no_visualizations {
        None
    } else {
        build_visualizer(&service)
    };

    let engine = SearchEngine::new(
        EngineConfig {
            tick: Duration::from_millis(cli.tick_ms),
            pool_size: cli.parallel as usize,
            computations_dir: service.dirs.computations.clone(),
            ..EngineConfig::default()
        },
        Collaborators {
            registry: Arc::new(InMemoryJobRegistry::new()),
            backend: Arc::new(backend),
            store: store.clone(),
            aligner: Arc::new(aligner),
            visualizer,
        },
    )?;

    let query = resolve_query(&engine, &*store, &cli.query, cli.chain.as_deref()).await?;
    let job_id = engine.submit(SearchRequest {
        query: query.chain_id.clone(),
        query_name: query.display_name.clone(),
        qscore_threshold: cli.threshold,
        num_results: cli.num_results,
        disable_visualizations: cli.no_visualizations,
        disable_search_stats: cli.no_search_stats,
    })?;
    info!(
        %job_id,
        query = %query.chain_id,
        name = %query.display_name,
        backend = %service.backend_url,
        "pdbsim {} searching",
        env!("CARGO_PKG_VERSION")
    );

    let mut frames = engine.subscribe(&job_id)?;

    let mut shutdown = spawn_ctrl_c_handler(Arc::new(InterruptCounter::default()));

    let mut stdout = tokio::io::stdout();
    let mut final_status = JobStatus::Computing;
    let mut error_message = None;

    loop {
        tokio::select! {
            ev = shutdown.next() => {
                match ev {
                    ShutdownEvent::AbortJob => {
                        eprintln!("Abort requested; waiting for the job to stop (press CTRL+C again to exit immediately).");
                        engine.abort(&job_id)?;
                    }
                    ShutdownEvent::Immediate => {
                        eprintln!("Abort requested again; exiting immediately.");
                        std::process::exit(130);
                    }
                }
            }
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                if let Some(update) = frame.as_update() {
                    final_status = update.status;
                    error_message = update.error_message.clone();
                }
                stdout.write_all(frame.to_ndjson_line()?.as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    match final_status {
        JobStatus::Finished => Ok(()),
        JobStatus::Aborted => std::process::exit(130),
        JobStatus::Error => anyhow::bail!(
            "search failed: {}",
            error_message.as_deref().unwrap_or("unknown error")
        ),
        JobStatus::Computing => anyhow::bail!("job stream ended before the search finished"),
    }
}
