// Property-based tests for monitors and result summaries
// Sample counts, timestamp ordering, best-effort collection, summarize skipping

use aif_common::config::Settings;
use aif_common::errors::{CollectorError, ResolutionError};
use aif_common::measurement::benchmarks::BenchmarkPayload;
use aif_common::measurement::collectors::{HostMetricsSource, MetricMap, ServiceMetricsCollector};
use aif_common::measurement::sampler::{new_buffer, snapshot, Sampler};
use aif_common::measurement::MeasurementScheduler;
use aif_common::models::{BenchmarkKind, JobRecord, JobType, MeasurementKind, ServiceKind, TaskState};
use aif_common::registry::JobRegistry;
use aif_common::resolver::TargetResolver;
use aif_common::results::{Namespace, ResultStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

struct FixedHost;

#[async_trait]
impl HostMetricsSource for FixedHost {
    async fn system(&self) -> Result<MetricMap, CollectorError> {
        let mut metrics = MetricMap::new();
        metrics.insert("cpu_usage".to_string(), json!(25.0));
        metrics.insert("memory_usage".to_string(), json!(50.0));
        Ok(metrics)
    }

    async fn gpu(&self) -> MetricMap {
        MetricMap::new()
    }
}

struct HealthyCollector;

#[async_trait]
impl ServiceMetricsCollector for HealthyCollector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Ollama
    }

    async fn collect(&self, _target: &str) -> Result<MetricMap, CollectorError> {
        let mut metrics = MetricMap::new();
        metrics.insert("ollama_requests_total".to_string(), json!(3.0));
        Ok(metrics)
    }
}

struct BrokenCollector;

#[async_trait]
impl ServiceMetricsCollector for BrokenCollector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Chroma
    }

    async fn collect(&self, _target: &str) -> Result<MetricMap, CollectorError> {
        Err(CollectorError::Connection("connection refused".to_string()))
    }
}

struct NeverResolves;

#[async_trait]
impl TargetResolver for NeverResolves {
    async fn resolve(&self, job_id: &str) -> Result<String, ResolutionError> {
        Err(ResolutionError::Aborted {
            job_id: job_id.to_string(),
            state: "CANCELLED".to_string(),
        })
    }
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn timestamps(samples: &[Value]) -> Vec<DateTime<Utc>> {
    samples
        .iter()
        .map(|s| {
            DateTime::parse_from_rfc3339(s["timestamp"].as_str().unwrap())
                .unwrap()
                .with_timezone(&Utc)
        })
        .collect()
}

fn collect_samples(collector: Arc<dyn ServiceMetricsCollector>, interval: u64, duration: u64) -> Vec<Value> {
    let sampler = Sampler::new(Arc::new(FixedHost), collector, Duration::from_secs(1));
    let buffer = new_buffer();
    paused_runtime().block_on(async {
        sampler
            .run(
                "node1",
                Duration::from_secs(interval),
                Duration::from_secs(duration),
                &buffer,
            )
            .await;
    });
    snapshot(&buffer)
}

// Property: a monitor of `duration` sampling every `interval` produces
// ceil(duration / interval) samples whose timestamps never decrease
#[test]
fn property_sample_count_and_monotonic_timestamps() {
    proptest!(ProptestConfig::with_cases(32), |(
        interval in 1u64..10,
        duration in 0u64..60
    )| {
        let samples = collect_samples(Arc::new(HealthyCollector), interval, duration);

        prop_assert_eq!(samples.len() as u64, duration.div_ceil(interval));
        let stamps = timestamps(&samples);
        prop_assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    });
}

#[test]
fn test_ten_seconds_every_two_seconds_gives_five_or_six_samples() {
    let samples = collect_samples(Arc::new(HealthyCollector), 2, 10);
    assert!((5..=6).contains(&samples.len()));

    let stamps = timestamps(&samples);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(samples[0]["system"]["cpu_usage"], 25.0);
    assert_eq!(samples[0]["service"]["ollama_requests_total"], 3.0);
}

// Property: a collector that always fails still yields a full-length sequence,
// each sample carrying the error in its service section
#[test]
fn property_failing_collector_still_yields_full_sequence() {
    proptest!(ProptestConfig::with_cases(16), |(
        interval in 1u64..5,
        duration in 1u64..30
    )| {
        let samples = collect_samples(Arc::new(BrokenCollector), interval, duration);

        prop_assert_eq!(samples.len() as u64, duration.div_ceil(interval));
        for sample in &samples {
            let error = sample["service"]["error"].as_str().unwrap_or_default();
            prop_assert!(error.starts_with("connection_error"));
            prop_assert_eq!(&sample["system"]["memory_usage"], &json!(50.0));
        }
    });
}

async fn scheduler_for(dir: &std::path::Path, collector: Arc<dyn ServiceMetricsCollector>) -> MeasurementScheduler {
    let registry = Arc::new(JobRegistry::new(dir.join("jobs.json")));
    registry
        .put(JobRecord::new("314", JobType::Service, "chroma", BTreeMap::new()).with_target("node9"))
        .await
        .unwrap();
    MeasurementScheduler::new(
        &Settings::default(),
        registry,
        Arc::new(NeverResolves),
        Arc::new(ResultStore::new(dir.join("results"))),
        HashMap::<BenchmarkKind, Arc<dyn BenchmarkPayload>>::new(),
        vec![collector],
        Arc::new(FixedHost),
    )
}

#[tokio::test(start_paused = true)]
async fn test_monitor_with_failing_collector_completes_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_for(dir.path(), Arc::new(BrokenCollector)).await;
    let params: BTreeMap<String, String> = [("interval", "2"), ("duration", "10")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let handle = scheduler
        .launch(MeasurementKind::Monitor, "chroma", "314", &params)
        .await
        .unwrap();
    assert!(!handle.is_finished());

    let task = handle.wait().await.unwrap();
    assert_eq!(task.state, TaskState::Completed);

    let store = ResultStore::new(dir.path().join("results"));
    let (_, payload) = store.read(task.result_path.as_deref().unwrap()).await.unwrap();
    assert_eq!(payload.as_array().unwrap().len(), 5);

    let summary = store.summarize("314").await.unwrap();
    assert_eq!(summary.monitors.len(), 1);
    assert_eq!(summary.monitors[0].samples, 5);
    assert_eq!(summary.monitors[0].sample_errors, 5);
}

#[tokio::test]
async fn test_monitor_for_unknown_job_is_target_unresolved() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_for(dir.path(), Arc::new(HealthyCollector)).await;

    let result = scheduler
        .launch(MeasurementKind::Monitor, "ollama", "404", &BTreeMap::new())
        .await;
    assert!(result.is_err());
    assert!(scheduler.list_tasks().is_empty());
}

#[tokio::test]
async fn test_summarize_skips_malformed_result() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::new(dir.path());

    store
        .write(
            Namespace::Benchmarks,
            "ollama_latency_42_20250101-100000-000",
            &json!({ "summary": { "avg_latency": 0.8, "successful_requests": 10, "total_requests": 10 } }),
        )
        .await
        .unwrap();
    store
        .write(
            Namespace::Benchmarks,
            "postgres_throughput_42_20250101-101500-000",
            &json!({ "summary": { "throughput": 1250.0 } }),
        )
        .await
        .unwrap();
    store
        .write(
            Namespace::Monitoring,
            "ollama_42_20250101-100000-000",
            &json!([
                { "timestamp": "2025-01-01T10:00:00Z", "system": { "cpu_usage": 10.0, "memory_usage": 30.0 }, "gpu": {}, "service": {} },
                { "timestamp": "2025-01-01T10:00:05Z", "system": { "cpu_usage": 20.0, "memory_usage": 40.0 }, "gpu": {}, "service": {} }
            ]),
        )
        .await
        .unwrap();
    std::fs::write(
        store.path_for(Namespace::Benchmarks, "chroma_throughput_42_20250101-102000-000"),
        "{ truncated",
    )
    .unwrap();
    // A result of job 420 must not leak into job 42
    store
        .write(
            Namespace::Benchmarks,
            "ollama_latency_420_20250101-100000-000",
            &json!({ "summary": { "avg_latency": 9.9 } }),
        )
        .await
        .unwrap();

    let summary = store.summarize("42").await.unwrap();
    assert_eq!(summary.benchmarks.len(), 2);
    assert_eq!(summary.monitors.len(), 1);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].name, "chroma_throughput_42_20250101-102000-000.json");

    let monitor = &summary.monitors[0];
    assert_eq!(monitor.samples, 2);
    assert_eq!(monitor.avg_cpu, Some(15.0));
    assert_eq!(monitor.last_memory, Some(40.0));

    let latency = summary
        .benchmarks
        .iter()
        .find(|b| b.name.starts_with("ollama_latency"))
        .unwrap();
    assert_eq!(latency.avg_latency, Some(0.8));
    assert_eq!(latency.successful_requests, Some(10));
}
