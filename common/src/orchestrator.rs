// Service orchestrator: submit → resolve → probe → persist

use crate::config::{PathsConfig, ServiceRecipe, Settings, INFRASTRUCTURE_KEYS};
use crate::errors::{OrchestratorError, ResolutionError};
use crate::gateway::{JobAttributes, SchedulerGateway, SubmitRequest};
use crate::models::{JobRecord, JobStatus, JobType, JobUpdate, ServiceState};
use crate::probe::ReadinessGate;
use crate::registry::JobRegistry;
use crate::resolver::TargetResolver;
use crate::telemetry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Result of one `start` call that got as far as a job id
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub job_id: String,
    pub state: ServiceState,
    pub target: Option<String>,
    /// Why the job never became reachable, when `state` is `Unreachable`
    pub resolution_error: Option<ResolutionError>,
}

/// Lowercased `defaults` with `overrides` applied on top
pub fn merge_parameters(
    defaults: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    defaults
        .iter()
        .chain(overrides.iter())
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.clone()))
        .collect()
}

/// Route each parameter either to the scheduler arguments or to the job environment.
///
/// Infrastructure keys become `--key=value` (underscores as hyphens); every other
/// key is exported in upper case.
pub fn split_parameters(params: &BTreeMap<String, String>) -> (Vec<String>, BTreeMap<String, String>) {
    let mut args = Vec::new();
    let mut environment = BTreeMap::new();
    for (key, value) in params {
        if INFRASTRUCTURE_KEYS.contains(&key.as_str()) {
            args.push(format!("--{}={}", key.replace('_', "-"), value));
        } else {
            environment.insert(key.to_ascii_uppercase(), value.clone());
        }
    }
    (args, environment)
}

/// Last `lines` lines of `text`
pub fn tail_lines(text: &str, lines: usize) -> Vec<String> {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|l| l.to_string()).collect()
}

/// ServiceOrchestrator drives a service from submission to a readiness verdict
pub struct ServiceOrchestrator {
    services: BTreeMap<String, ServiceRecipe>,
    paths: PathsConfig,
    gateway: Arc<dyn SchedulerGateway>,
    resolver: Arc<dyn TargetResolver>,
    prober: Arc<dyn ReadinessGate>,
    registry: Arc<JobRegistry>,
}

impl ServiceOrchestrator {
    pub fn new(
        settings: &Settings,
        gateway: Arc<dyn SchedulerGateway>,
        resolver: Arc<dyn TargetResolver>,
        prober: Arc<dyn ReadinessGate>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            services: settings.services.clone(),
            paths: settings.paths.clone(),
            gateway,
            resolver,
            prober,
            registry,
        }
    }

    /// Build the submission for `label` without submitting it
    pub async fn prepare(
        &self,
        label: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<(SubmitRequest, BTreeMap<String, String>), OrchestratorError> {
        let recipe = self
            .services
            .get(label)
            .ok_or_else(|| OrchestratorError::UnknownService(label.to_string()))?;

        let script = self.paths.script_path(recipe);
        if tokio::fs::metadata(&script).await.is_err() {
            return Err(OrchestratorError::ScriptMissing(script.display().to_string()));
        }

        let parameters = merge_parameters(&recipe.default_params, overrides);
        let (args, environment) = split_parameters(&parameters);
        Ok((
            SubmitRequest {
                args,
                script,
                environment,
            },
            parameters,
        ))
    }

    /// Submit, resolve, and probe a service once.
    ///
    /// Errors are returned only when no job was submitted or the registry failed.
    /// An unreachable or unhealthy service is a normal outcome.
    #[instrument(skip(self, overrides), fields(overrides = overrides.len()))]
    pub async fn start(
        &self,
        label: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<StartOutcome, OrchestratorError> {
        let (request, parameters) = match self.prepare(label, overrides).await {
            Ok(prepared) => prepared,
            Err(e) => {
                telemetry::record_service_start("not_submitted");
                return Err(e);
            }
        };

        let job_id = match self.gateway.submit(&request).await {
            Ok(job_id) => job_id,
            Err(e) => {
                telemetry::record_service_start("not_submitted");
                return Err(e.into());
            }
        };
        info!(label = %label, job_id = %job_id, "Service submitted");

        self.registry
            .put(JobRecord::new(&job_id, JobType::Service, label, parameters.clone()))
            .await?;

        let target = match self.resolver.resolve(&job_id).await {
            Ok(target) => target,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Service never became reachable");
                self.registry
                    .update(&job_id, JobUpdate::status(JobStatus::Failed))
                    .await?;
                telemetry::record_service_start("unreachable");
                return Ok(StartOutcome {
                    job_id,
                    state: ServiceState::Unreachable,
                    target: None,
                    resolution_error: Some(e),
                });
            }
        };

        self.registry
            .update(&job_id, JobUpdate::target(&target).and_status(JobStatus::Running))
            .await?;

        let state = self
            .probe_and_record(&job_id, label, &target, &parameters)
            .await?;
        telemetry::record_service_start(&state.to_string());

        Ok(StartOutcome {
            job_id,
            state,
            target: Some(target),
            resolution_error: None,
        })
    }

    async fn probe_and_record(
        &self,
        job_id: &str,
        label: &str,
        target: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ServiceState, OrchestratorError> {
        let (status, state) = if self.prober.probe(label, target, parameters).await {
            (JobStatus::Healthy, ServiceState::Healthy)
        } else {
            (JobStatus::Unhealthy, ServiceState::Unhealthy)
        };
        self.registry.update(job_id, JobUpdate::status(status)).await?;
        Ok(state)
    }

    /// Probe an already-registered service again on operator request
    #[instrument(skip(self))]
    pub async fn recheck(&self, job_id: &str) -> Result<ServiceState, OrchestratorError> {
        let record = self
            .registry
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownJob(job_id.to_string()))?;
        let target = record
            .target
            .ok_or_else(|| OrchestratorError::NoTarget(job_id.to_string()))?;

        self.probe_and_record(job_id, &record.label, &target, &record.parameters)
            .await
    }

    /// Cancel a job. The registry is marked stopped only when the scheduler accepted
    /// the cancellation.
    #[instrument(skip(self))]
    pub async fn stop(&self, job_id: &str) -> Result<(), OrchestratorError> {
        self.gateway.cancel(job_id).await?;
        self.registry
            .update(job_id, JobUpdate::status(JobStatus::Stopped))
            .await?;
        Ok(())
    }

    pub fn list_definitions(&self) -> &BTreeMap<String, ServiceRecipe> {
        &self.services
    }

    pub async fn list_running(&self) -> Result<String, OrchestratorError> {
        Ok(self.gateway.list_mine().await?)
    }

    pub async fn check(&self, job_id: &str) -> Result<JobAttributes, OrchestratorError> {
        Ok(self.gateway.query_status(job_id).await?)
    }

    /// Last `lines` lines of the job's standard output file
    #[instrument(skip(self))]
    pub async fn logs(&self, job_id: &str, lines: usize) -> Result<Vec<String>, OrchestratorError> {
        let attributes = self.gateway.query_status(job_id).await?;
        let path = attributes.stdout_path().ok_or_else(|| {
            OrchestratorError::LogUnavailable(format!("job {} reports no StdOut path", job_id))
        })?;

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| OrchestratorError::LogUnavailable(format!("{}: {}", path, e)))?;
        Ok(tail_lines(&text, lines))
    }
}
