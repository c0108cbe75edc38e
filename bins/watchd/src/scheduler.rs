use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use watch_core::browser::BrowserHandle;
use watch_core::cron;
use watch_core::store::StateStore;
use watch_core::watch::{self, Cadence, WatchConfig};

use crate::engine::{Command, Engine};
use crate::module::{Module, ModuleCtx};
use crate::notify::{Notify, Router};
use crate::runner;

const RELOAD_INTERVAL: Duration = Duration::from_secs(30);
const CRON_TICK: Duration = Duration::from_secs(60);

/// Owns per-watch timers and cron tickers, reconciles the config directory
/// every 30s, and consumes manual-trigger commands.
pub struct Scheduler {
    browser: Arc<dyn BrowserHandle>,
    commands: mpsc::Receiver<Command>,
}

impl Scheduler {
    pub fn new(browser: Arc<dyn BrowserHandle>, commands: mpsc::Receiver<Command>) -> Scheduler {
        Scheduler { browser, commands }
    }
}

impl Module for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        let Scheduler { browser, mut commands } = *self;
        tokio::spawn(async move {
            let notifier: Arc<Router> = Arc::new(Router::new(ctx.engine.clone()));
            let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
            let mut tasks: HashMap<String, JoinHandle<()>> = HashMap::new();

            let mut reload = interval(RELOAD_INTERVAL);
            reload.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = reload.tick() => {
                        reconcile(&ctx, &browser, &notifier, &semaphore, &mut tasks).await;
                    }
                    command = commands.recv() => {
                        match command {
                            Some(Command::Trigger(id)) => {
                                trigger(&ctx, &browser, &notifier, &semaphore, id).await;
                            }
                            None => {}
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_ok() && *ctx.shutdown.borrow() {
                            info!("scheduler stopping");
                            break;
                        }
                    }
                }
            }

            for (id, task) in tasks {
                debug!("stopping timer for {id}");
                task.abort();
            }
            Ok(())
        })
    }
}

/// What one reload cycle has to do, given current and desired hash sets.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReconcilePlan {
    added: Vec<String>,
    changed: Vec<String>,
    removed: Vec<String>,
}

fn plan_reconcile(
    current: &HashMap<String, String>,
    desired: &[(String, String)],
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for (id, hash) in desired {
        match current.get(id) {
            None => plan.added.push(id.clone()),
            Some(existing) if existing != hash => plan.changed.push(id.clone()),
            Some(_) => {}
        }
    }
    let desired_ids: std::collections::HashSet<&String> =
        desired.iter().map(|(id, _)| id).collect();
    for id in current.keys() {
        if !desired_ids.contains(id) {
            plan.removed.push(id.clone());
        }
    }
    plan.removed.sort();
    plan
}

async fn reconcile(
    ctx: &ModuleCtx,
    browser: &Arc<dyn BrowserHandle>,
    notifier: &Arc<Router>,
    semaphore: &Arc<Semaphore>,
    tasks: &mut HashMap<String, JoinHandle<()>>,
) {
    let settings = ctx.engine.settings().clone();
    let report = match watch::load_dir(&settings.config_dir) {
        Ok(report) => report,
        Err(err) => {
            warn!("config scan failed: {err:#}");
            return;
        }
    };
    for rejected in &report.rejected {
        warn!("rejected config {}: {}", rejected.path.display(), rejected.reason);
    }

    let mut desired: Vec<(String, WatchConfig)> = Vec::new();
    for config in report.watches {
        if !config.enabled {
            debug!("watch {} is disabled", config.watch_id());
            continue;
        }
        let id = config.watch_id();
        if desired.iter().any(|(existing, _)| existing == &id) {
            warn!("duplicate watch id {id}, keeping the first");
            continue;
        }
        desired.push((id, config));
    }

    let current = ctx.engine.config_hashes().await;
    let hashes: Vec<(String, String)> = desired
        .iter()
        .map(|(id, config)| (id.clone(), config.content_hash.clone()))
        .collect();
    let plan = plan_reconcile(&current, &hashes);

    for id in &plan.removed {
        info!("watch {id} removed or disabled, tearing down");
        if let Some(task) = tasks.remove(id) {
            task.abort();
        }
        ctx.engine.remove_watch(id).await;
    }

    let mut fresh = 0u32;
    for (id, config) in desired {
        if plan.changed.contains(&id) {
            info!("watch {id} changed, rescheduling");
            if let Some(task) = tasks.remove(&id) {
                task.abort();
            }
            ctx.engine.upsert_watch(config.clone()).await;
            tasks.insert(
                id,
                spawn_watch_task(ctx, browser, notifier, semaphore, config, Duration::ZERO),
            );
        } else if plan.added.contains(&id) {
            let delay = settings.stagger_delay * fresh;
            fresh += 1;
            info!("scheduling watch {id} ({})", config.display_name());
            ctx.engine.upsert_watch(config.clone()).await;
            tasks.insert(
                id,
                spawn_watch_task(ctx, browser, notifier, semaphore, config, delay),
            );
        }
    }
}

async fn trigger(
    ctx: &ModuleCtx,
    browser: &Arc<dyn BrowserHandle>,
    notifier: &Arc<Router>,
    semaphore: &Arc<Semaphore>,
    id: String,
) {
    match ctx.engine.watch(&id).await {
        Some(config) => {
            info!("manual trigger for {id}");
            let engine = ctx.engine.clone();
            let store = ctx.store.clone();
            let browser = browser.clone();
            let notifier = notifier.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                run_guarded(&engine, &store, &browser, &notifier, &semaphore, &config).await;
            });
        }
        None => warn!("trigger for unknown watch {id}"),
    }
}

fn spawn_watch_task(
    ctx: &ModuleCtx,
    browser: &Arc<dyn BrowserHandle>,
    notifier: &Arc<Router>,
    semaphore: &Arc<Semaphore>,
    config: WatchConfig,
    delay: Duration,
) -> JoinHandle<()> {
    let engine = ctx.engine.clone();
    let store = ctx.store.clone();
    let browser = browser.clone();
    let notifier = notifier.clone();
    let semaphore = semaphore.clone();
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        run_guarded(&engine, &store, &browser, &notifier, &semaphore, &config).await;

        match config.cadence(engine.settings().check_interval) {
            Cadence::Every(period) => {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    run_guarded(&engine, &store, &browser, &notifier, &semaphore, &config).await;
                }
            }
            Cadence::Cron(expr) => {
                let mut last = Some(cron::minute_key(&Local::now()));
                let mut ticker = interval(CRON_TICK);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let now = Local::now();
                    if expr.should_fire(&now, last.as_deref()) {
                        last = Some(cron::minute_key(&now));
                        run_guarded(&engine, &store, &browser, &notifier, &semaphore, &config)
                            .await;
                    }
                }
            }
        }
    })
}

async fn run_guarded(
    engine: &Engine,
    store: &StateStore,
    browser: &Arc<dyn BrowserHandle>,
    notifier: &Arc<Router>,
    semaphore: &Arc<Semaphore>,
    config: &WatchConfig,
) {
    let Ok(_permit) = semaphore.acquire().await else { return };
    let notifier: &dyn Notify = notifier.as_ref();
    runner::run_watch(engine, store, browser.as_ref(), notifier, config).await;
}
