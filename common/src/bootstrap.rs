// Bootstrap utilities for binary initialization
// Builds every component from one Settings value

use crate::config::Settings;
use crate::gateway::slurm::SlurmGateway;
use crate::gateway::SchedulerGateway;
use crate::measurement::MeasurementScheduler;
use crate::orchestrator::ServiceOrchestrator;
use crate::probe::{ReadinessGate, ReadinessProber};
use crate::registry::JobRegistry;
use crate::resolver::{NodeResolver, TargetResolver};
use crate::results::ResultStore;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load and validate settings from `config_dir`
///
/// # Errors
/// Returns error if a configuration source is malformed or validation fails
pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let settings = Settings::load_from_path(config_dir).with_context(|| {
        format!("Failed to load configuration from {}", config_dir.display())
    })?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(settings)
}

/// Every long-lived component of one `aif` process
pub struct AppContext {
    pub settings: Settings,
    pub gateway: Arc<dyn SchedulerGateway>,
    pub registry: Arc<JobRegistry>,
    pub results: Arc<ResultStore>,
    pub orchestrator: ServiceOrchestrator,
    pub measurements: MeasurementScheduler,
}

impl AppContext {
    /// Wire components against the Slurm gateway
    ///
    /// # Errors
    /// Returns error if a readiness check or measurement payload cannot be built
    #[tracing::instrument(skip(settings))]
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let gateway: Arc<dyn SchedulerGateway> =
            Arc::new(SlurmGateway::new(settings.scheduler.clone()));
        Self::with_gateway(settings, gateway)
    }

    /// Wire components against an arbitrary gateway
    pub fn with_gateway(settings: Settings, gateway: Arc<dyn SchedulerGateway>) -> Result<Self> {
        let registry = Arc::new(JobRegistry::new(settings.paths.registry_file.clone()));
        let results = Arc::new(ResultStore::new(settings.paths.results_dir.clone()));
        let resolver: Arc<dyn TargetResolver> = Arc::new(NodeResolver::new(
            gateway.clone(),
            settings.scheduler.max_wait(),
            settings.scheduler.poll_interval(),
        ));
        let prober: Arc<dyn ReadinessGate> = Arc::new(
            ReadinessProber::from_settings(&settings)
                .context("Failed to build readiness checks")?,
        );

        let orchestrator = ServiceOrchestrator::new(
            &settings,
            gateway.clone(),
            resolver.clone(),
            prober,
            registry.clone(),
        );
        let measurements =
            MeasurementScheduler::from_settings(&settings, registry.clone(), resolver, results.clone())
                .context("Failed to build measurement scheduler")?;

        info!(
            registry = %settings.paths.registry_file.display(),
            results = %settings.paths.results_dir.display(),
            services = settings.services.len(),
            benchmarks = settings.benchmarks.len(),
            "Application context initialized"
        );

        Ok(Self {
            settings,
            gateway,
            registry,
            results,
            orchestrator,
            measurements,
        })
    }
}
