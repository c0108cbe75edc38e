use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use watch_core::browser::BrowserHandle;
use watch_core::cfg::{self, AppId, Settings};
use watch_core::logx;
use watch_core::store::StateStore;

mod actions;
mod driver;
mod engine;
mod extract;
mod module;
mod notify;
mod runner;
mod scheduler;
#[cfg(test)]
mod testutil;
mod web;

use crate::module::{Module, ModuleCtx};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Web page watch daemon")]
struct Cli {
    /// Log level override (info,debug,trace)
    #[arg(long)]
    log: Option<String>,
    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the daemon (the default).
    Run,
    /// Validate watch configuration documents and exit.
    CheckConfig {
        /// Directory to scan instead of CONFIG_DIR.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = cfg::load_or_init(&APP)?;
    logx::init(cli.log.as_deref().unwrap_or(&conf.log_level));

    let settings = Settings::from_env(&APP)?;
    match cli.cmd.unwrap_or(Cmd::Run) {
        Cmd::CheckConfig { dir } => check_config(dir.as_deref().unwrap_or(&settings.config_dir)),
        Cmd::Run => run(settings).await,
    }
}

fn check_config(dir: &Path) -> Result<()> {
    let report = watch_core::watch::load_dir(dir)?;
    for watch in &report.watches {
        info!(
            "ok {} id={} ({})",
            watch
                .source_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            watch.watch_id(),
            watch.display_name(),
        );
    }
    for rejected in &report.rejected {
        warn!("rejected {}: {}", rejected.path.display(), rejected.reason);
    }
    info!(
        "{} valid, {} rejected in {}",
        report.watches.len(),
        report.rejected.len(),
        dir.display()
    );
    if !report.rejected.is_empty() {
        anyhow::bail!("{} config document(s) rejected", report.rejected.len());
    }
    Ok(())
}

async fn run(settings: Settings) -> Result<()> {
    for dir in [
        &settings.config_dir,
        &settings.state_dir,
        &settings.screenshot_dir,
        &settings.session_dir,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create {}", dir.display()))?;
    }

    info!("watchd boot");
    info!("config dir {}", settings.config_dir.display());

    let browser = driver::CdpBrowser::launch(settings.proxy.as_ref()).await?;
    let browser: Arc<dyn BrowserHandle> = Arc::new(browser);
    let engine = engine::Engine::new(settings.clone());
    let store = StateStore::open(&settings.state_dir)?;

    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ctx = ModuleCtx {
        engine: engine.clone(),
        store: store.clone(),
        shutdown: shutdown_rx,
    };
    let mut tasks = Vec::new();

    let sch = Box::new(scheduler::Scheduler::new(browser.clone(), trigger_rx));
    info!("module start: {}", sch.name());
    tasks.push(sch.spawn(ctx.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.health_port));
    let srv = Box::new(web::StatusServer::new(addr, trigger_tx.clone()));
    info!("module start: {}", srv.name());
    tasks.push(srv.spawn(ctx));

    info!("modules started; press Ctrl+C to stop");
    signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("module ended with error: {err}"),
            Err(err) => warn!("join error: {err}"),
        }
    }

    drop(trigger_tx);
    browser.close().await;
    Ok(())
}
