// Error handling framework
// One enum per component; orchestration outcomes that are normal negatives
// (unreachable, unhealthy) are modelled as state, not as errors.

use thiserror::Error;

/// Scheduler gateway errors (sbatch / scontrol / scancel / squeue)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Job submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Could not parse job id from submission output: {0}")]
    UnparseableSubmission(String),

    #[error("Status query for job {job_id} failed: {reason}")]
    QueryFailed { job_id: String, reason: String },

    #[error("Cancellation of job {job_id} failed: {reason}")]
    CancelFailed { job_id: String, reason: String },

    #[error("Scheduler command unavailable: {0}")]
    CommandUnavailable(String),
}

/// Node resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Timed out after {waited_secs}s waiting for job {job_id} to get a node")]
    Timeout { job_id: String, waited_secs: u64 },

    #[error("Job {job_id} reached state {state} before getting a node")]
    Aborted { job_id: String, state: String },

    #[error("Resolution of job {job_id} aborted by a failed status query: {reason}")]
    QueryFailed { job_id: String, reason: String },
}

/// Readiness probe errors; never escape the prober, which reports `false`
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Database check failed: {0}")]
    Database(String),

    #[error("Service not ready after {0}s")]
    SlowStartTimeout(u64),

    #[error("No readiness check for service: {0}")]
    UnknownService(String),
}

/// Job registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Job registry unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to serialize job registry: {0}")]
    Serialization(String),
}

/// Result store errors
#[derive(Error, Debug)]
pub enum ResultStoreError {
    #[error("Result write failed: {0}")]
    WriteFailed(String),

    #[error("Result already exists: {0}")]
    AlreadyExists(String),

    #[error("Result not found: {0}")]
    NotFound(String),

    #[error("Result unreadable: {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Filesystem error: {0}")]
    FileSystem(String),
}

/// Service metric collection errors; recorded per sample, never propagated
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("timeout")]
    Timeout,

    #[error("connection_error: {0}")]
    Connection(String),

    #[error("{0}")]
    Other(String),
}

/// Measurement scheduler errors
#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("Could not determine a target for job {0}")]
    TargetUnresolved(String),

    #[error("Unknown measurement definition: {0}")]
    UnknownDefinition(String),

    #[error("No collector registered for service kind: {0}")]
    NoCollector(String),

    #[error("Invalid measurement parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Benchmark execution failed: {0}")]
    PayloadFailed(String),

    #[error("Measurement task {0} failed to complete")]
    TaskAborted(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    ResultStore(#[from] ResultStoreError),
}

/// Service orchestrator errors. Only "could not even submit" and environment
/// failures are errors; resolution and readiness outcomes are reported as state.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service script not found: {0}")]
    ScriptMissing(String),

    #[error("Job not tracked in registry: {0}")]
    UnknownJob(String),

    #[error("Job {0} has no known target")]
    NoTarget(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to read job output: {0}")]
    LogUnavailable(String),
}

impl OrchestratorError {
    /// True when the failure happened before a job id existed
    pub fn is_submission_failure(&self) -> bool {
        matches!(
            self,
            OrchestratorError::UnknownService(_)
                | OrchestratorError::ScriptMissing(_)
                | OrchestratorError::Scheduler(SchedulerError::SubmissionFailed(_))
                | OrchestratorError::Scheduler(SchedulerError::UnparseableSubmission(_))
                | OrchestratorError::Scheduler(SchedulerError::CommandUnavailable(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_failures_are_distinguished() {
        let err = OrchestratorError::from(SchedulerError::SubmissionFailed("boom".into()));
        assert!(err.is_submission_failure());

        let err = OrchestratorError::ScriptMissing("services/run.sh".into());
        assert!(err.is_submission_failure());

        let err = OrchestratorError::UnknownJob("42".into());
        assert!(!err.is_submission_failure());
    }

    #[test]
    fn test_resolution_error_messages() {
        let err = ResolutionError::Aborted {
            job_id: "7".into(),
            state: "FAILED".into(),
        };
        assert_eq!(
            err.to_string(),
            "Job 7 reached state FAILED before getting a node"
        );
    }

    #[test]
    fn test_collector_error_renders_short_reason() {
        assert_eq!(CollectorError::Timeout.to_string(), "timeout");
    }
}
