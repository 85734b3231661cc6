// Interval sampling loop shared by every monitor

use crate::errors::CollectorError;
use crate::measurement::collectors::{HostMetricsSource, MetricMap, ServiceMetricsCollector};
use crate::telemetry;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Samples shared between the sampling loop and the task that persists them,
/// so a partial sequence survives a failed loop
pub type SampleBuffer = Arc<Mutex<Vec<Value>>>;

pub fn new_buffer() -> SampleBuffer {
    Arc::new(Mutex::new(Vec::new()))
}

/// Snapshot of a buffer, even when a panicking writer poisoned it
pub fn snapshot(buffer: &SampleBuffer) -> Vec<Value> {
    match buffer.lock() {
        Ok(samples) => samples.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn error_section(e: &CollectorError) -> Value {
    json!({ "error": e.to_string() })
}

/// Sampler collects host and service metrics for one target
pub struct Sampler {
    host: Arc<dyn HostMetricsSource>,
    collector: Arc<dyn ServiceMetricsCollector>,
    collector_timeout: Duration,
}

impl Sampler {
    pub fn new(
        host: Arc<dyn HostMetricsSource>,
        collector: Arc<dyn ServiceMetricsCollector>,
        collector_timeout: Duration,
    ) -> Self {
        Self {
            host,
            collector,
            collector_timeout,
        }
    }

    /// One sample. Each section is best-effort: a failure becomes an `error` field.
    pub async fn sample(&self, target: &str, at: DateTime<Utc>) -> Value {
        let system = match timeout(self.collector_timeout, self.host.system()).await {
            Ok(Ok(metrics)) => Value::Object(metrics),
            Ok(Err(e)) => error_section(&e),
            Err(_) => error_section(&CollectorError::Timeout),
        };

        let gpu = match timeout(self.collector_timeout, self.host.gpu()).await {
            Ok(metrics) => Value::Object(metrics),
            Err(_) => Value::Object(MetricMap::new()),
        };

        let service = match timeout(self.collector_timeout, self.collector.collect(target)).await {
            Ok(Ok(metrics)) => Value::Object(metrics),
            Ok(Err(e)) => error_section(&e),
            Err(_) => error_section(&CollectorError::Timeout),
        };

        json!({
            "timestamp": at.to_rfc3339_opts(SecondsFormat::Micros, true),
            "system": system,
            "gpu": gpu,
            "service": service,
        })
    }

    /// Sample every `interval` until `duration` has elapsed, appending to `buffer`.
    ///
    /// The elapsed check happens before each sample, so a sample is never started
    /// at or after `duration`. Timestamps are derived from a monotonic clock and
    /// never decrease.
    pub async fn run(&self, target: &str, interval: Duration, duration: Duration, buffer: &SampleBuffer) {
        let wall_start = Utc::now();
        let started = Instant::now();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= duration {
                break;
            }

            let at = wall_start
                + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
            let sample = self.sample(target, at).await;
            let count = {
                let mut samples = match buffer.lock() {
                    Ok(samples) => samples,
                    Err(poisoned) => poisoned.into_inner(),
                };
                samples.push(sample);
                samples.len()
            };
            telemetry::record_sample(self.collector.kind());
            debug!(target = %target, samples = count, "Collected sample");

            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceKind;
    use async_trait::async_trait;

    struct StaticHost;

    #[async_trait]
    impl HostMetricsSource for StaticHost {
        async fn system(&self) -> Result<MetricMap, CollectorError> {
            let mut m = MetricMap::new();
            m.insert("cpu_usage".to_string(), json!(12.5));
            m.insert("memory_usage".to_string(), json!(40.0));
            Ok(m)
        }

        async fn gpu(&self) -> MetricMap {
            MetricMap::new()
        }
    }

    struct SlowCollector;

    #[async_trait]
    impl ServiceMetricsCollector for SlowCollector {
        fn kind(&self) -> ServiceKind {
            ServiceKind::Ollama
        }

        async fn collect(&self, _target: &str) -> Result<MetricMap, CollectorError> {
            sleep(Duration::from_secs(60)).await;
            Ok(MetricMap::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_collector_is_recorded_as_timeout() {
        let sampler = Sampler::new(Arc::new(StaticHost), Arc::new(SlowCollector), Duration::from_secs(1));
        let sample = sampler.sample("node1", Utc::now()).await;
        assert_eq!(sample["service"]["error"], "timeout");
        assert_eq!(sample["system"]["cpu_usage"], 12.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_collects_nothing() {
        let sampler = Sampler::new(Arc::new(StaticHost), Arc::new(SlowCollector), Duration::from_secs(1));
        let buffer = new_buffer();
        sampler
            .run("node1", Duration::from_secs(1), Duration::ZERO, &buffer)
            .await;
        assert!(snapshot(&buffer).is_empty());
    }
}
