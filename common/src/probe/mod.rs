// Readiness prober: per-service-kind round-trip checks against a resolved target

pub mod http;
pub mod postgres;

use crate::config::{ProbeConfig, Settings};
use crate::errors::ProbeError;
use crate::models::ServiceKind;
use crate::telemetry;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

pub use http::{ChromaCheck, OllamaCheck};
pub use postgres::PostgresCheck;

/// A semantically meaningful round trip against one kind of service
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn kind(&self) -> ServiceKind;

    async fn try_check(&self, target: &str) -> Result<(), ProbeError>;

    /// Definite yes/no; errors are logged and reported as `false`
    async fn check(&self, target: &str) -> bool {
        match self.try_check(target).await {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %self.kind(), target = %target, error = %e, "Readiness check failed");
                false
            }
        }
    }
}

/// ReadinessGate answers "is the service behind `label` usable at `target`".
/// `params` are the job's effective parameters (recipe defaults plus overrides).
#[async_trait]
pub trait ReadinessGate: Send + Sync {
    async fn probe(&self, label: &str, target: &str, params: &BTreeMap<String, String>) -> bool;
}

/// Construct the check for a service kind from a job's parameters
/// (e.g. `model` for ollama)
pub fn build_check(
    kind: ServiceKind,
    probes: &ProbeConfig,
    params: &BTreeMap<String, String>,
) -> Result<Arc<dyn ReadinessCheck>, ProbeError> {
    let check: Arc<dyn ReadinessCheck> = match kind {
        ServiceKind::Ollama => Arc::new(OllamaCheck::from_config(probes, params)?),
        ServiceKind::Postgres => Arc::new(PostgresCheck::from_config(probes)),
        ServiceKind::Chroma => Arc::new(ChromaCheck::from_config(probes)?),
    };
    Ok(check)
}

/// ReadinessProber builds the check for each probe from the label's service kind
/// and the job's parameters. A check registered for a label replaces the built one.
pub struct ReadinessProber {
    probes: ProbeConfig,
    kinds: HashMap<String, ServiceKind>,
    by_label: HashMap<String, Arc<dyn ReadinessCheck>>,
}

impl ReadinessProber {
    pub fn new(probes: ProbeConfig) -> Self {
        Self {
            probes,
            kinds: HashMap::new(),
            by_label: HashMap::new(),
        }
    }

    /// Prober that knows the kind of every configured service. Each recipe's
    /// default check is built once so bad probe settings fail at start-up.
    pub fn from_settings(settings: &Settings) -> Result<Self, ProbeError> {
        let mut prober = Self::new(settings.probes.clone());
        for (label, recipe) in &settings.services {
            build_check(recipe.kind, &settings.probes, &recipe.default_params)?;
            prober.kinds.insert(label.clone(), recipe.kind);
        }
        Ok(prober)
    }

    pub fn register_label(&mut self, label: impl Into<String>, check: Arc<dyn ReadinessCheck>) {
        self.by_label.insert(label.into(), check);
    }

    fn kind_of(&self, label: &str) -> Option<ServiceKind> {
        self.kinds
            .get(label)
            .copied()
            .or_else(|| label.parse::<ServiceKind>().ok())
    }

    fn check_for(
        &self,
        label: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn ReadinessCheck>, ProbeError> {
        if let Some(check) = self.by_label.get(label) {
            return Ok(check.clone());
        }
        let kind = self
            .kind_of(label)
            .ok_or_else(|| ProbeError::UnknownService(label.to_string()))?;
        build_check(kind, &self.probes, params)
    }
}

#[async_trait]
impl ReadinessGate for ReadinessProber {
    #[instrument(skip(self, params))]
    async fn probe(&self, label: &str, target: &str, params: &BTreeMap<String, String>) -> bool {
        let check = match self.check_for(label, params) {
            Ok(check) => check,
            Err(e) => {
                warn!(label = %label, error = %e, "No readiness check for service, reporting unhealthy");
                return false;
            }
        };

        let started = std::time::Instant::now();
        let healthy = check.check(target).await;
        info!(
            label = %label,
            target = %target,
            healthy,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Readiness probe finished"
        );
        telemetry::record_probe(check.kind(), healthy);
        healthy
    }
}

/// Poll `attempt` until it succeeds or `budget` is spent.
///
/// Used by slow-starting services (model download, server boot) before the real
/// round trip. The last attempt's error is logged; the result is a timeout.
pub async fn wait_until_ready<F, Fut>(
    what: &str,
    budget: Duration,
    poll: Duration,
    mut attempt: F,
) -> Result<(), ProbeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ProbeError>>,
{
    let started = Instant::now();
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) => debug!(what = %what, error = %e, "Not ready yet"),
        }

        let elapsed = started.elapsed();
        if elapsed >= budget {
            return Err(ProbeError::SlowStartTimeout(budget.as_secs()));
        }
        sleep(poll.min(budget - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedCheck {
        kind: ServiceKind,
        healthy: bool,
    }

    #[async_trait]
    impl ReadinessCheck for FixedCheck {
        fn kind(&self) -> ServiceKind {
            self.kind
        }

        async fn try_check(&self, _target: &str) -> Result<(), ProbeError> {
            if self.healthy {
                Ok(())
            } else {
                Err(ProbeError::UnexpectedResponse("no".to_string()))
            }
        }
    }

    fn no_params() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn test_registered_check_replaces_built_one() {
        let mut prober = ReadinessProber::new(ProbeConfig::default());
        prober.register_label(
            "llama_small",
            Arc::new(FixedCheck {
                kind: ServiceKind::Ollama,
                healthy: true,
            }),
        );

        assert!(prober.probe("llama_small", "node1", &no_params()).await);
    }

    #[tokio::test]
    async fn test_unknown_label_is_unhealthy() {
        let prober = ReadinessProber::new(ProbeConfig::default());
        assert!(!prober.probe("mystery", "node1", &no_params()).await);
    }

    fn quick_probes() -> ProbeConfig {
        ProbeConfig {
            request_timeout_seconds: 5,
            slow_start_budget_seconds: 1,
            slow_start_poll_seconds: 1,
            ..ProbeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_probe_uses_the_jobs_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "models": [{ "name": "mistral:latest" }] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "model": "mistral" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "ok" })))
            .mount(&server)
            .await;

        let mut settings = Settings::default();
        settings.probes = quick_probes();
        let prober = ReadinessProber::from_settings(&settings).unwrap();
        let target = server.address().to_string();

        let mistral: BTreeMap<String, String> =
            [("model".to_string(), "mistral".to_string())].into_iter().collect();
        assert!(prober.probe("ollama", &target, &mistral).await);

        let llama: BTreeMap<String, String> =
            [("model".to_string(), "llama2".to_string())].into_iter().collect();
        assert!(!prober.probe("ollama", &target, &llama).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_succeeds_after_retries() {
        let attempts = AtomicUsize::new(0);
        let result = wait_until_ready("svc", Duration::from_secs(60), Duration::from_secs(10), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProbeError::Http("refused".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_gives_up_after_budget() {
        let started = Instant::now();
        let result = wait_until_ready("svc", Duration::from_secs(30), Duration::from_secs(10), || async {
            Err(ProbeError::Http("refused".to_string()))
        })
        .await;

        assert!(matches!(result, Err(ProbeError::SlowStartTimeout(30))));
        assert!(started.elapsed() <= Duration::from_secs(30));
    }
}
