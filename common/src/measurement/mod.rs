// Measurement scheduler: runs benchmarks and monitors against running services

pub mod benchmarks;
pub mod collectors;
pub mod sampler;

use crate::config::{BenchmarkRecipe, ServiceRecipe, Settings};
use crate::errors::{MeasurementError, ResultStoreError};
use crate::models::{
    measurement_identity, BenchmarkKind, JobRecord, JobStatus, JobUpdate, MeasurementKind,
    MeasurementTask, ServiceKind, TaskState,
};
use crate::orchestrator::merge_parameters;
use crate::registry::JobRegistry;
use crate::resolver::TargetResolver;
use crate::results::{Namespace, ResultStore};
use crate::telemetry;
use benchmarks::{BenchmarkContext, BenchmarkPayload};
use chrono::Utc;
use collectors::{HostMetricsSource, ServiceMetricsCollector, SysinfoHost};
use sampler::{new_buffer, snapshot, Sampler};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Monitor timing used when a launch does not override it
#[derive(Debug, Clone, Copy)]
pub struct MonitorDefaults {
    pub interval: Duration,
    pub duration: Duration,
    pub collector_timeout: Duration,
}

impl MonitorDefaults {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: Duration::from_secs(settings.monitoring.default_interval_seconds),
            duration: Duration::from_secs(settings.monitoring.default_duration_seconds),
            collector_timeout: Duration::from_secs(settings.monitoring.collector_timeout_seconds),
        }
    }
}

/// Handle to a launched measurement.
///
/// Benchmarks complete before `launch` returns; monitors report their state
/// through the watch channel and their final task through the join handle.
pub struct TaskHandle {
    task_id: String,
    state: watch::Receiver<MeasurementTask>,
    join: Option<JoinHandle<MeasurementTask>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Latest known view of the task
    pub fn current(&self) -> MeasurementTask {
        self.state.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.current().state.is_terminal()
    }

    /// Wait for the task to reach a terminal state
    pub async fn wait(self) -> Result<MeasurementTask, MeasurementError> {
        match self.join {
            Some(join) => join
                .await
                .map_err(|_| MeasurementError::TaskAborted(self.task_id.clone())),
            None => Ok(self.state.borrow().clone()),
        }
    }
}

fn seconds_param(
    params: &mut BTreeMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, MeasurementError> {
    match params.remove(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| MeasurementError::InvalidParameter {
                key: key.to_string(),
                reason: format!("expected whole seconds, got '{}'", raw),
            }),
    }
}

/// MeasurementScheduler launches benchmarks and monitors for a source job
pub struct MeasurementScheduler {
    registry: Arc<JobRegistry>,
    resolver: Arc<dyn TargetResolver>,
    store: Arc<ResultStore>,
    services: BTreeMap<String, ServiceRecipe>,
    benchmarks: BTreeMap<String, BenchmarkRecipe>,
    payloads: HashMap<BenchmarkKind, Arc<dyn BenchmarkPayload>>,
    collectors: HashMap<ServiceKind, Arc<dyn ServiceMetricsCollector>>,
    host: Arc<dyn HostMetricsSource>,
    defaults: MonitorDefaults,
    tracked: Mutex<HashMap<String, watch::Receiver<MeasurementTask>>>,
}

impl MeasurementScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        registry: Arc<JobRegistry>,
        resolver: Arc<dyn TargetResolver>,
        store: Arc<ResultStore>,
        payloads: HashMap<BenchmarkKind, Arc<dyn BenchmarkPayload>>,
        collectors: Vec<Arc<dyn ServiceMetricsCollector>>,
        host: Arc<dyn HostMetricsSource>,
    ) -> Self {
        Self {
            registry,
            resolver,
            store,
            services: settings.services.clone(),
            benchmarks: settings.benchmarks.clone(),
            payloads,
            collectors: collectors.into_iter().map(|c| (c.kind(), c)).collect(),
            host,
            defaults: MonitorDefaults::from_settings(settings),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Scheduler with the built-in payloads, collectors and host source
    pub fn from_settings(
        settings: &Settings,
        registry: Arc<JobRegistry>,
        resolver: Arc<dyn TargetResolver>,
        store: Arc<ResultStore>,
    ) -> Result<Self, MeasurementError> {
        let payloads = benchmarks::build_payloads(&settings.probes)?;
        let collectors = collectors::build_collectors(
            &settings.probes,
            Duration::from_secs(settings.monitoring.collector_timeout_seconds),
        )
        .map_err(|e| MeasurementError::NoCollector(e.to_string()))?;
        let host = Arc::new(SysinfoHost::new(settings.monitoring.gpu_metrics));
        Ok(Self::new(settings, registry, resolver, store, payloads, collectors, host))
    }

    pub fn benchmark_definitions(&self) -> &BTreeMap<String, BenchmarkRecipe> {
        &self.benchmarks
    }

    pub fn defaults(&self) -> MonitorDefaults {
        self.defaults
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Receiver<MeasurementTask>>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitor_kind(&self, label: &str) -> Option<ServiceKind> {
        self.services
            .get(label)
            .map(|r| r.kind)
            .or_else(|| label.parse().ok())
    }

    /// Target of `job_id`: the registry first, then a fresh resolution
    async fn target_of(&self, job_id: &str) -> Result<String, MeasurementError> {
        if let Some(target) = self.registry.get(job_id).await?.and_then(|r| r.target) {
            return Ok(target);
        }

        match self.resolver.resolve(job_id).await {
            Ok(target) => {
                self.registry.update(job_id, JobUpdate::target(target.clone())).await?;
                Ok(target)
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "No target for measurement");
                Err(MeasurementError::TargetUnresolved(job_id.to_string()))
            }
        }
    }

    /// Launch a benchmark or monitor named `label` against the target of `source_job_id`.
    ///
    /// A benchmark has finished when this returns. A monitor runs detached; the
    /// returned handle reports its progress.
    #[instrument(skip(self, params), fields(kind = %kind))]
    pub async fn launch(
        &self,
        kind: MeasurementKind,
        label: &str,
        source_job_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<TaskHandle, MeasurementError> {
        match kind {
            MeasurementKind::Benchmark => self.run_benchmark(label, source_job_id, params).await,
            MeasurementKind::Monitor => self.start_monitor(label, source_job_id, params).await,
        }
    }

    async fn register(
        &self,
        task: &MeasurementTask,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), MeasurementError> {
        let record = JobRecord::new(
            task.task_id.clone(),
            task.kind.job_type(),
            task.label.clone(),
            parameters.clone(),
        )
        .with_parent(task.source_job_id.clone())
        .with_target(task.target.clone())
        .with_status(JobStatus::Running);
        self.registry.put(record).await?;
        Ok(())
    }

    async fn run_benchmark(
        &self,
        label: &str,
        source_job_id: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<TaskHandle, MeasurementError> {
        let recipe = self
            .benchmarks
            .get(label)
            .ok_or_else(|| MeasurementError::UnknownDefinition(label.to_string()))?;
        let payload = self
            .payloads
            .get(&recipe.benchmark)
            .cloned()
            .ok_or_else(|| MeasurementError::UnknownDefinition(recipe.benchmark.to_string()))?;
        let parameters = merge_parameters(&recipe.default_params, overrides);
        let target = self.target_of(source_job_id).await?;

        let started_at = Utc::now();
        let task_id = measurement_identity(label, source_job_id, started_at);
        let output_path = self.store.path_for(Namespace::Benchmarks, &task_id);
        let mut task = MeasurementTask {
            task_id: task_id.clone(),
            kind: MeasurementKind::Benchmark,
            label: label.to_string(),
            source_job_id: source_job_id.to_string(),
            target: target.clone(),
            started_at,
            interval: Duration::ZERO,
            duration: None,
            state: TaskState::Running,
            result_path: None,
        };
        self.register(&task, &parameters).await?;
        info!(task_id = %task_id, target = %target, benchmark = %recipe.benchmark, "Benchmark started");

        let ctx = BenchmarkContext {
            target,
            task_name: task_id.clone(),
            output_path,
            parameters,
        };
        let outcome = match payload.run(&ctx).await {
            Ok(report) => self
                .store
                .write(Namespace::Benchmarks, &task_id, &report)
                .await
                .map_err(MeasurementError::from),
            Err(e) => Err(e),
        };

        let (state, status) = match &outcome {
            Ok(_) => (TaskState::Completed, JobStatus::Stopped),
            Err(_) => (TaskState::Failed, JobStatus::Failed),
        };
        if let Err(e) = self.registry.update(&task_id, JobUpdate::status(status)).await {
            error!(task_id = %task_id, error = %e, "Failed to record benchmark status");
        }
        telemetry::record_measurement(MeasurementKind::Benchmark, state);

        let path = outcome.map_err(|e| {
            error!(task_id = %task_id, error = %e, "Benchmark failed");
            e
        })?;
        info!(task_id = %task_id, path = %path.display(), "Benchmark completed");

        task.state = state;
        task.result_path = Some(path.display().to_string());
        let (_, rx) = watch::channel(task);
        Ok(TaskHandle {
            task_id,
            state: rx,
            join: None,
        })
    }

    async fn start_monitor(
        &self,
        label: &str,
        source_job_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<TaskHandle, MeasurementError> {
        let kind = self
            .monitor_kind(label)
            .ok_or_else(|| MeasurementError::UnknownDefinition(label.to_string()))?;
        let collector = self
            .collectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| MeasurementError::NoCollector(kind.to_string()))?;

        let mut parameters = merge_parameters(&BTreeMap::new(), params);
        let interval = seconds_param(&mut parameters, "interval", self.defaults.interval)?;
        let duration = seconds_param(&mut parameters, "duration", self.defaults.duration)?;
        if interval.is_zero() {
            return Err(MeasurementError::InvalidParameter {
                key: "interval".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        let target = self.target_of(source_job_id).await?;

        let started_at = Utc::now();
        let task_id = measurement_identity(label, source_job_id, started_at);
        let task = MeasurementTask {
            task_id: task_id.clone(),
            kind: MeasurementKind::Monitor,
            label: label.to_string(),
            source_job_id: source_job_id.to_string(),
            target: target.clone(),
            started_at,
            interval,
            duration: Some(duration),
            state: TaskState::Running,
            result_path: None,
        };
        parameters.insert("interval".to_string(), interval.as_secs().to_string());
        parameters.insert("duration".to_string(), duration.as_secs().to_string());
        self.register(&task, &parameters).await?;

        let (tx, rx) = watch::channel(task.clone());
        let monitor = MonitorRun {
            sampler: Sampler::new(self.host.clone(), collector, self.defaults.collector_timeout),
            registry: self.registry.clone(),
            store: self.store.clone(),
            task,
            state: tx,
        };
        let join = tokio::spawn(monitor.run());
        self.tracked().insert(task_id.clone(), rx.clone());
        info!(
            task_id = %task_id,
            target = %target,
            interval_secs = interval.as_secs(),
            duration_secs = duration.as_secs(),
            "Monitor started"
        );

        Ok(TaskHandle {
            task_id,
            state: rx,
            join: Some(join),
        })
    }

    /// Stop tracking a monitor. A running sampling loop is not interrupted and
    /// still persists its samples when it finishes.
    pub fn cancel(&self, task_id: &str) -> bool {
        let removed = self.tracked().remove(task_id).is_some();
        if removed {
            info!(task_id = %task_id, "Monitor no longer tracked");
        } else {
            warn!(task_id = %task_id, "Monitor not tracked");
        }
        removed
    }

    /// Tracked monitors, oldest first. A finished monitor appears in one listing
    /// and is then no longer tracked.
    pub fn list_tasks(&self) -> Vec<MeasurementTask> {
        let mut tracked = self.tracked();
        let mut tasks: Vec<MeasurementTask> =
            tracked.values().map(|rx| rx.borrow().clone()).collect();
        tracked.retain(|_, rx| !rx.borrow().state.is_terminal());
        drop(tracked);

        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        tasks
    }

    /// Number of monitors still tracked
    pub fn tracked_count(&self) -> usize {
        self.tracked().len()
    }
}

/// One detached monitor: sampling loop plus persistence
struct MonitorRun {
    sampler: Sampler,
    registry: Arc<JobRegistry>,
    store: Arc<ResultStore>,
    task: MeasurementTask,
    state: watch::Sender<MeasurementTask>,
}

impl MonitorRun {
    async fn run(mut self) -> MeasurementTask {
        let task_id = self.task.task_id.clone();
        let buffer = new_buffer();

        let sampler = self.sampler;
        let target = self.task.target.clone();
        let interval = self.task.interval;
        let duration = self.task.duration.unwrap_or_default();
        let loop_buffer = buffer.clone();
        let sampling = tokio::spawn(async move {
            sampler.run(&target, interval, duration, &loop_buffer).await;
        });
        let loop_ok = match sampling.await {
            Ok(()) => true,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Sampling loop aborted");
                false
            }
        };

        let samples = snapshot(&buffer);
        let count = samples.len();
        let written: Result<PathBuf, ResultStoreError> = self
            .store
            .write(Namespace::Monitoring, &task_id, &Value::Array(samples))
            .await;

        let state = match (&written, loop_ok) {
            (Ok(_), true) => TaskState::Completed,
            _ => TaskState::Failed,
        };
        match &written {
            Ok(path) => {
                info!(task_id = %task_id, samples = count, path = %path.display(), "Monitor finished");
                self.task.result_path = Some(path.display().to_string());
            }
            Err(e) => error!(task_id = %task_id, samples = count, error = %e, "Failed to persist monitor samples"),
        }

        let status = match state {
            TaskState::Completed => JobStatus::Stopped,
            _ => JobStatus::Failed,
        };
        if let Err(e) = self.registry.update(&task_id, JobUpdate::status(status)).await {
            error!(task_id = %task_id, error = %e, "Failed to record monitor status");
        }
        telemetry::record_measurement(MeasurementKind::Monitor, state);

        self.task.state = state;
        self.state.send_replace(self.task.clone());
        self.task
    }
}
