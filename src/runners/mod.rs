pub mod local;
pub mod models;

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{READY_POLL_INTERVAL, ready_timeout};
use crate::plan::ExecPlan;
use crate::ports::PortTable;
use models::RunSummary;

#[derive(Clone, Debug)]
pub struct RunCtx {
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub ports: PortTable,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    /// Don't echo child output.
    pub quiet: bool,
}

impl Default for RunCtx {
    fn default() -> Self {
        Self {
            env: vec![],
            cwd: None,
            ports: PortTable::default(),
            ready_timeout: ready_timeout(),
            ready_interval: READY_POLL_INTERVAL,
            quiet: false,
        }
    }
}

#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, plan: &ExecPlan, ctx: &RunCtx) -> Result<RunSummary>;
    async fn run_argv(&self, label: &str, argv: &[String], ctx: &RunCtx) -> Result<RunSummary>;
}
