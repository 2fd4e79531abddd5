use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::registry::TaskRegistry;

#[derive(Clone)]
pub struct ModuleCtx {
    pub registry: Arc<TaskRegistry>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

/// A long-running piece of the daemon, spawned once at startup.
pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
