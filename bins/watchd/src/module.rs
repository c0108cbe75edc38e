use tokio::task::JoinHandle;
use watch_core::store::StateStore;

use crate::engine::Engine;

#[derive(Clone)]
pub struct ModuleCtx {
    pub engine: Engine,
    pub store: StateStore,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
