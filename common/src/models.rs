use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Job Registry Models
// ============================================================================

/// JobType classifies what a scheduler job was submitted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Service,
    Benchmark,
    Monitor,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::Service => "service",
            JobType::Benchmark => "benchmark",
            JobType::Monitor => "monitor",
        };
        f.pad(s)
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "service" => Ok(JobType::Service),
            "benchmark" => Ok(JobType::Benchmark),
            "monitor" => Ok(JobType::Monitor),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

/// JobStatus is the persisted lifecycle status of a JobRecord
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Running,
    Healthy,
    Unhealthy,
    Stopped,
    Failed,
}

impl JobStatus {
    /// Whether the registry accepts a move from `self` to `next`.
    ///
    /// `Stopped` is terminal. `Healthy` and `Unhealthy` may flip on an explicit
    /// re-check. A `Failed` job can still be cancelled into `Stopped`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        match self {
            Submitted => true,
            Running => matches!(next, Healthy | Unhealthy | Stopped | Failed),
            Healthy | Unhealthy => matches!(next, Healthy | Unhealthy | Stopped | Failed),
            Failed => next == Stopped,
            Stopped => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Healthy => "healthy",
            JobStatus::Unhealthy => "unhealthy",
            JobStatus::Stopped => "stopped",
            JobStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

/// JobRecord is one submitted unit of work, keyed by the scheduler's job id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: JobType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
}

impl JobRecord {
    /// Create a freshly submitted record with no target
    pub fn new(
        job_id: impl Into<String>,
        job_type: JobType,
        label: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            label: label.into(),
            target: None,
            created_at: Utc::now(),
            status: JobStatus::Submitted,
            parameters,
            parent_job_id: None,
        }
    }

    pub fn with_parent(mut self, parent_job_id: impl Into<String>) -> Self {
        self.parent_job_id = Some(parent_job_id.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}

/// JobUpdate carries the mutable fields of a JobRecord.
///
/// There is no way to clear a target: it only ever goes from absent to present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub target: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn and_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_none() && self.status.is_none()
    }
}

// ============================================================================
// Service Models
// ============================================================================

/// ServiceKind selects the readiness check, metrics collector, and default port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Ollama,
    Postgres,
    Chroma,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Ollama, ServiceKind::Postgres, ServiceKind::Chroma];

    pub fn default_port(self) -> u16 {
        match self {
            ServiceKind::Ollama => 11434,
            ServiceKind::Postgres => 5432,
            ServiceKind::Chroma => 8000,
        }
    }

    /// Host and port for a target; a `host:port` target overrides the default port
    pub fn address(self, target: &str) -> (String, u16) {
        if let Some((host, port)) = target.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (target.to_string(), self.default_port())
    }

    pub fn base_url(self, target: &str) -> String {
        let (host, port) = self.address(target);
        format!("http://{}:{}", host, port)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceKind::Ollama => "ollama",
            ServiceKind::Postgres => "postgres",
            ServiceKind::Chroma => "chroma",
        };
        f.pad(s)
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(ServiceKind::Ollama),
            "postgres" | "postgresql" => Ok(ServiceKind::Postgres),
            "chroma" | "chromadb" => Ok(ServiceKind::Chroma),
            other => Err(format!("unknown service kind '{}'", other)),
        }
    }
}

/// BenchmarkKind names a benchmark payload implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkKind {
    OllamaLatency,
    OllamaStreaming,
    PostgresThroughput,
    PostgresTransaction,
    ChromaThroughput,
    ChromaQuery,
}

impl BenchmarkKind {
    pub const ALL: [BenchmarkKind; 6] = [
        BenchmarkKind::OllamaLatency,
        BenchmarkKind::OllamaStreaming,
        BenchmarkKind::PostgresThroughput,
        BenchmarkKind::PostgresTransaction,
        BenchmarkKind::ChromaThroughput,
        BenchmarkKind::ChromaQuery,
    ];

    /// The service kind this payload talks to
    pub fn service_kind(self) -> ServiceKind {
        match self {
            BenchmarkKind::OllamaLatency | BenchmarkKind::OllamaStreaming => ServiceKind::Ollama,
            BenchmarkKind::PostgresThroughput | BenchmarkKind::PostgresTransaction => {
                ServiceKind::Postgres
            }
            BenchmarkKind::ChromaThroughput | BenchmarkKind::ChromaQuery => ServiceKind::Chroma,
        }
    }
}

impl fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            BenchmarkKind::OllamaLatency => "ollama_latency",
            BenchmarkKind::OllamaStreaming => "ollama_streaming",
            BenchmarkKind::PostgresThroughput => "postgres_throughput",
            BenchmarkKind::PostgresTransaction => "postgres_transaction",
            BenchmarkKind::ChromaThroughput => "chroma_throughput",
            BenchmarkKind::ChromaQuery => "chroma_query",
        })
    }
}

/// ServiceState tracks one `start` invocation through submit, resolve and probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Submitted,
    Resolving,
    Ready,
    Unreachable,
    Healthy,
    Unhealthy,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Submitted => "submitted",
            ServiceState::Resolving => "resolving",
            ServiceState::Ready => "ready",
            ServiceState::Unreachable => "unreachable",
            ServiceState::Healthy => "healthy",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Stopped => "stopped",
        };
        f.pad(s)
    }
}

// ============================================================================
// Measurement Models
// ============================================================================

/// MeasurementKind distinguishes single-shot benchmarks from sampled monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    Benchmark,
    Monitor,
}

impl MeasurementKind {
    pub fn job_type(self) -> JobType {
        match self {
            MeasurementKind::Benchmark => JobType::Benchmark,
            MeasurementKind::Monitor => JobType::Monitor,
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            MeasurementKind::Benchmark => "benchmark",
            MeasurementKind::Monitor => "monitor",
        })
    }
}

/// TaskState of a MeasurementTask; `Completed` and `Failed` are set exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        })
    }
}

/// MeasurementTask is the in-memory view of one benchmark or monitor run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementTask {
    pub task_id: String,
    pub kind: MeasurementKind,
    pub label: String,
    pub source_job_id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs_opt")]
    pub duration: Option<Duration>,
    pub state: TaskState,
    pub result_path: Option<String>,
}

/// Stamp used in task ids and result file names. Millisecond precision keeps
/// identities distinct for launches within the same second.
pub fn identity_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M%S-%3f").to_string()
}

/// Compose `<label>_<job_id>_<timestamp>`
pub fn measurement_identity(label: &str, source_job_id: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}_{}", label, source_job_id, identity_timestamp(at))
}

/// Split an identity back into (label, job_id, timestamp). The timestamp and job id
/// never contain underscores, so the label may.
pub fn parse_measurement_identity(identity: &str) -> Option<(&str, &str, &str)> {
    let mut parts = identity.rsplitn(3, '_');
    let timestamp = parts.next()?;
    let job_id = parts.next()?;
    let label = parts.next()?;
    if label.is_empty() || job_id.is_empty() || timestamp.is_empty() {
        return None;
    }
    Some((label, job_id, timestamp))
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

mod duration_secs_opt {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Healthy));
        assert!(JobStatus::Healthy.can_transition_to(JobStatus::Unhealthy));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Stopped));
        assert!(!JobStatus::Stopped.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Healthy.can_transition_to(JobStatus::Submitted));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Healthy));
    }

    #[test]
    fn test_job_record_serializes_lowercase_enums() {
        let record = JobRecord::new("123", JobType::Service, "ollama", BTreeMap::new());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["job_type"], "service");
        assert_eq!(json["status"], "submitted");
        assert!(json.get("target").is_none());
    }

    #[test]
    fn test_identity_round_trip_with_underscored_label() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 5).unwrap();
        let identity = measurement_identity("ollama_latency", "4711", at);
        assert_eq!(identity, "ollama_latency_4711_20250301-123005-000");

        let (label, job_id, ts) = parse_measurement_identity(&identity).unwrap();
        assert_eq!(label, "ollama_latency");
        assert_eq!(job_id, "4711");
        assert_eq!(ts, "20250301-123005-000");
    }

    #[test]
    fn test_parse_identity_rejects_short_names() {
        assert!(parse_measurement_identity("nounderscore").is_none());
        assert!(parse_measurement_identity("a_b").is_none());
    }

    #[test]
    fn test_service_kind_aliases() {
        assert_eq!("postgresql".parse::<ServiceKind>().unwrap(), ServiceKind::Postgres);
        assert_eq!("ChromaDB".parse::<ServiceKind>().unwrap(), ServiceKind::Chroma);
        assert!("vllm".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_service_address() {
        assert_eq!(ServiceKind::Ollama.base_url("gpu07"), "http://gpu07:11434");
        assert_eq!(
            ServiceKind::Chroma.address("127.0.0.1:39001"),
            ("127.0.0.1".to_string(), 39001)
        );
        assert_eq!(ServiceKind::Postgres.address("node1"), ("node1".to_string(), 5432));
    }
}
