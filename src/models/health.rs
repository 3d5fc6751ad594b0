use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Liveness of a single worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    pub alive: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
}

/// Supervisor-level view of the whole service. Degraded iff any worker
/// process is down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub total_processes: usize,
    pub alive_processes: usize,
    pub processes: Vec<WorkerHealth>,
}
