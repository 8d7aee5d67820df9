// src/runners/models.rs
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What happened to one launched command.
#[derive(Debug, Clone, Serialize)]
pub struct LeafOutcome {
    pub workflow: String,
    pub command: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_port: Option<u16>,
    pub ready: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LeafOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub leaves: Vec<LeafOutcome>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.leaves.iter().all(LeafOutcome::success)
    }

    pub fn first_failure(&self) -> Option<&LeafOutcome> {
        self.leaves.iter().find(|l| !l.success())
    }
}
