mod module;
mod registry;
mod runner;
mod scheduler;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_core::store::SnapshotStore;
use beacon_core::{cfg, logx};
use clap::Parser;
use tracing::{error, info};

use crate::module::{Module, ModuleCtx};
use crate::registry::TaskRegistry;
use crate::runner::HttpExecutor;
use crate::web::WebServer;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Periodic HTTP task scheduler")]
struct Cli {
    /// Task snapshot file (default: ./config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log level override (info,debug,trace); RUST_LOG wins
    #[arg(long)]
    log: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logx::init(cli.log.as_deref().unwrap_or(cfg::DEFAULT_LOG_LEVEL));

    let path = cfg::config_path(cli.config.as_deref())?;
    build_runtime()?.block_on(run(path))
}

#[cfg(feature = "rt-single")]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

#[cfg(not(feature = "rt-single"))]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .build()
        .context("build tokio runtime")
}

async fn run(path: PathBuf) -> Result<()> {
    info!("{} boot config={}", env!("CARGO_PKG_NAME"), path.display());

    let executor = HttpExecutor::new()?;
    let registry = Arc::new(TaskRegistry::new(SnapshotStore::new(&path), executor));
    if let Err(e) = registry.restore() {
        error!("load error: {:#}", e);
    }

    let (tx, rx) = tokio::sync::watch::channel(false);
    let ctx = ModuleCtx { registry: registry.clone(), shutdown: rx };

    let web: Box<dyn Module> = Box::new(WebServer::new(cfg::bind_addr(registry.port())));
    info!("starting module {}", web.name());
    let mut server = web.spawn(ctx);

    // No drain for task loops: they end with the process.
    tokio::select! {
        res = &mut server => {
            return res.context("web module panicked")?;
        }
        sig = tokio::signal::ctrl_c() => {
            sig.context("wait for ctrl-c")?;
            info!("shutdown requested");
        }
    }
    let _ = tx.send(true);
    server.await.context("web module panicked")?
}
