// Scenario tests for the service orchestrator
// Submit → resolve → probe against a mocked scheduler and readiness gate

use aif_common::config::{ServiceRecipe, Settings};
use aif_common::errors::{OrchestratorError, ResolutionError, SchedulerError};
use aif_common::gateway::{JobAttributes, SchedulerGateway, SubmitRequest};
use aif_common::models::{JobStatus, ServiceKind, ServiceState};
use aif_common::orchestrator::ServiceOrchestrator;
use aif_common::probe::ReadinessGate;
use aif_common::registry::JobRegistry;
use aif_common::resolver::NodeResolver;
use async_trait::async_trait;
use mockall::mock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Gateway {}

    #[async_trait]
    impl SchedulerGateway for Gateway {
        async fn submit(&self, request: &SubmitRequest) -> Result<String, SchedulerError>;
        async fn query_status(&self, job_id: &str) -> Result<JobAttributes, SchedulerError>;
        async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError>;
        async fn list_mine(&self) -> Result<String, SchedulerError>;
    }
}

mock! {
    pub Gate {}

    #[async_trait]
    impl ReadinessGate for Gate {
        async fn probe(&self, label: &str, target: &str, params: &BTreeMap<String, String>) -> bool;
    }
}

struct Scenario {
    _dir: tempfile::TempDir,
    registry: Arc<JobRegistry>,
    orchestrator: ServiceOrchestrator,
}

fn scenario(gateway: MockGateway, gate: MockGate) -> Scenario {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("run_ollama.sh"), "#!/bin/bash\nollama serve\n").unwrap();

    let mut settings = Settings::default();
    settings.paths.scripts_dir = dir.path().to_path_buf();
    settings.services.insert(
        "ollama".to_string(),
        ServiceRecipe {
            kind: ServiceKind::Ollama,
            script: "run_ollama.sh".to_string(),
            description: None,
            default_params: [("partition", "gpu"), ("model", "llama2")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
    );

    let gateway: Arc<dyn SchedulerGateway> = Arc::new(gateway);
    let resolver = Arc::new(NodeResolver::new(
        gateway.clone(),
        Duration::from_secs(10),
        Duration::from_secs(5),
    ));
    let registry = Arc::new(JobRegistry::new(dir.path().join("jobs.json")));
    let orchestrator =
        ServiceOrchestrator::new(&settings, gateway, resolver, Arc::new(gate), registry.clone());

    Scenario {
        _dir: dir,
        registry,
        orchestrator,
    }
}

fn submitting(job_id: &'static str) -> MockGateway {
    let mut gateway = MockGateway::new();
    gateway
        .expect_submit()
        .times(1)
        .withf(|request| request.args.contains(&"--partition=gpu".to_string()))
        .returning(move |_| Ok(job_id.to_string()));
    gateway
}

#[tokio::test(start_paused = true)]
async fn test_pending_then_running_ends_healthy() {
    let mut gateway = submitting("4242");
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    gateway
        .expect_query_status()
        .withf(|job_id| job_id == "4242")
        .returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                Ok(JobAttributes::from_pairs([("JobState", "PENDING"), ("NodeList", "(null)")]))
            } else {
                Ok(JobAttributes::from_pairs([("JobState", "RUNNING"), ("NodeList", "gpu01")]))
            }
        });

    let mut gate = MockGate::new();
    gate.expect_probe()
        .withf(|label, target, _| label == "ollama" && target == "gpu01")
        .times(1)
        .returning(|_, _, _| true);

    let s = scenario(gateway, gate);
    let outcome = s.orchestrator.start("ollama", &BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.job_id, "4242");
    assert_eq!(outcome.state, ServiceState::Healthy);
    assert_eq!(polls.load(Ordering::SeqCst), 2);

    let record = s.registry.get("4242").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Healthy);
    assert_eq!(record.target.as_deref(), Some("gpu01"));
    assert_eq!(record.parameters.get("model").map(String::as_str), Some("llama2"));
}

#[tokio::test(start_paused = true)]
async fn test_pending_forever_is_unreachable_and_never_probed() {
    let mut gateway = submitting("51");
    gateway
        .expect_query_status()
        .returning(|_| Ok(JobAttributes::from_pairs([("JobState", "PENDING"), ("NodeList", "(null)")])));

    let mut gate = MockGate::new();
    gate.expect_probe().never();

    let s = scenario(gateway, gate);
    let outcome = s.orchestrator.start("ollama", &BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state, ServiceState::Unreachable);
    assert!(matches!(outcome.resolution_error, Some(ResolutionError::Timeout { .. })));

    let record = s.registry.get("51").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.target.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_readiness_leaves_job_running_as_unhealthy() {
    let mut gateway = submitting("60");
    gateway
        .expect_query_status()
        .returning(|_| Ok(JobAttributes::from_pairs([("JobState", "RUNNING"), ("NodeList", "cpu7")])));
    gateway.expect_cancel().never();

    let mut gate = MockGate::new();
    gate.expect_probe().times(1).returning(|_, _, _| false);

    let s = scenario(gateway, gate);
    let outcome = s.orchestrator.start("ollama", &BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state, ServiceState::Unhealthy);
    assert_eq!(outcome.target.as_deref(), Some("cpu7"));
    let record = s.registry.get("60").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Unhealthy);
}

#[tokio::test]
async fn test_submission_failure_is_an_error_without_a_record() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_submit()
        .returning(|_| Err(SchedulerError::SubmissionFailed("invalid partition".to_string())));
    gateway.expect_query_status().never();

    let s = scenario(gateway, MockGate::new());
    let err = s.orchestrator.start("ollama", &BTreeMap::new()).await.unwrap_err();

    assert!(err.is_submission_failure());
    assert!(matches!(
        err,
        OrchestratorError::Scheduler(SchedulerError::SubmissionFailed(_))
    ));
    assert!(s.registry.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_override_reaches_submission_environment() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_submit()
        .times(1)
        .withf(|request| {
            request.environment.get("MODEL").map(String::as_str) == Some("mistral")
                && request.args.contains(&"--time=01:00:00".to_string())
        })
        .returning(|_| Ok("70".to_string()));
    gateway
        .expect_query_status()
        .returning(|_| Ok(JobAttributes::from_pairs([("JobState", "RUNNING"), ("NodeList", "n1")])));

    let mut gate = MockGate::new();
    gate.expect_probe()
        .times(2)
        .withf(|_, _, params| params.get("model").map(String::as_str) == Some("mistral"))
        .returning(|_, _, _| true);

    let s = scenario(gateway, gate);
    let overrides: BTreeMap<String, String> = [("MODEL", "mistral"), ("time", "01:00:00")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let outcome = s.orchestrator.start("ollama", &overrides).await.unwrap();
    assert_eq!(outcome.state, ServiceState::Healthy);

    // A later health check probes the model the job was started with
    assert_eq!(s.orchestrator.recheck("70").await.unwrap(), ServiceState::Healthy);
}
