// Scheduler gateway: submit / query / cancel / list against the cluster scheduler

pub mod slurm;

use crate::errors::SchedulerError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub use slurm::SlurmGateway;

/// Values the scheduler reports in place of a node list before allocation
const PLACEHOLDER_TARGETS: &[&str] = &["(null)", "(none)", "none", "none assigned", "n/a"];

/// A job submission: scheduler arguments, the batch script, and the environment
/// the job is launched with. Keys never appear in both `args` and `environment`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitRequest {
    pub args: Vec<String>,
    pub script: PathBuf,
    pub environment: BTreeMap<String, String>,
}

/// Scheduler-reported job state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerJobState {
    Pending,
    Configuring,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    Preempted,
    OutOfMemory,
    Suspended,
    Other(String),
}

impl SchedulerJobState {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().trim_end_matches('+').to_ascii_uppercase();
        match normalized.as_str() {
            "PENDING" | "PD" => SchedulerJobState::Pending,
            "CONFIGURING" | "CF" => SchedulerJobState::Configuring,
            "RUNNING" | "R" => SchedulerJobState::Running,
            "COMPLETING" | "CG" => SchedulerJobState::Completing,
            "COMPLETED" | "CD" => SchedulerJobState::Completed,
            "FAILED" | "F" => SchedulerJobState::Failed,
            "CANCELLED" | "CA" => SchedulerJobState::Cancelled,
            "TIMEOUT" | "TO" => SchedulerJobState::Timeout,
            "NODE_FAIL" | "NF" => SchedulerJobState::NodeFail,
            "PREEMPTED" | "PR" => SchedulerJobState::Preempted,
            "OUT_OF_MEMORY" | "OOM" => SchedulerJobState::OutOfMemory,
            "SUSPENDED" | "S" => SchedulerJobState::Suspended,
            _ => SchedulerJobState::Other(normalized),
        }
    }

    /// Still waiting for an allocation
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            SchedulerJobState::Pending | SchedulerJobState::Configuring
        )
    }
}

impl fmt::Display for SchedulerJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerJobState::Pending => "PENDING",
            SchedulerJobState::Configuring => "CONFIGURING",
            SchedulerJobState::Running => "RUNNING",
            SchedulerJobState::Completing => "COMPLETING",
            SchedulerJobState::Completed => "COMPLETED",
            SchedulerJobState::Failed => "FAILED",
            SchedulerJobState::Cancelled => "CANCELLED",
            SchedulerJobState::Timeout => "TIMEOUT",
            SchedulerJobState::NodeFail => "NODE_FAIL",
            SchedulerJobState::Preempted => "PREEMPTED",
            SchedulerJobState::OutOfMemory => "OUT_OF_MEMORY",
            SchedulerJobState::Suspended => "SUSPENDED",
            SchedulerJobState::Other(s) => s.as_str(),
        };
        f.pad(s)
    }
}

/// Key/value job attributes as reported by the scheduler's status query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobAttributes {
    fields: BTreeMap<String, String>,
    raw: String,
}

impl JobAttributes {
    pub fn new(fields: BTreeMap<String, String>, raw: impl Into<String>) -> Self {
        Self {
            fields,
            raw: raw.into(),
        }
    }

    /// Build attributes from `(key, value)` pairs; mainly for fakes and tests
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let fields: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let raw = fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        Self { fields, raw }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn state(&self) -> Option<SchedulerJobState> {
        self.get("JobState").map(SchedulerJobState::parse)
    }

    /// The execution target, or `None` while the scheduler reports a placeholder
    pub fn target(&self) -> Option<&str> {
        self.get("NodeList")
            .map(str::trim)
            .filter(|node| !is_placeholder_target(node))
    }

    pub fn stdout_path(&self) -> Option<&str> {
        self.get("StdOut").filter(|p| !p.is_empty())
    }

    /// The unparsed status output, for display
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// Whether a node list value means "not yet allocated"
pub fn is_placeholder_target(node: &str) -> bool {
    let node = node.trim();
    node.is_empty() || PLACEHOLDER_TARGETS.contains(&node.to_ascii_lowercase().as_str())
}

/// SchedulerGateway is the only path to the external cluster scheduler
#[async_trait]
pub trait SchedulerGateway: Send + Sync {
    /// Submit a batch job and return the scheduler's job id
    async fn submit(&self, request: &SubmitRequest) -> Result<String, SchedulerError>;

    /// Query job attributes; must expose at least `JobState` and `NodeList`
    async fn query_status(&self, job_id: &str) -> Result<JobAttributes, SchedulerError>;

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError>;

    /// Free-form listing of the current user's jobs, for display
    async fn list_mine(&self) -> Result<String, SchedulerError>;
}
