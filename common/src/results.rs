// Result store: one JSON file per measurement run, written once, atomically

use crate::errors::ResultStoreError;
use crate::models::parse_measurement_identity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Number of trailing monitor samples averaged for the CPU / memory headline
const RECENT_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Benchmarks,
    Monitoring,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Benchmarks, Namespace::Monitoring];

    pub fn dir_name(self) -> &'static str {
        match self {
            Namespace::Benchmarks => "benchmarks",
            Namespace::Monitoring => "monitoring",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.dir_name())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "benchmarks" | "benchmark" => Ok(Namespace::Benchmarks),
            "monitoring" | "monitor" | "monitors" => Ok(Namespace::Monitoring),
            other => Err(format!("unknown result namespace '{}'", other)),
        }
    }
}

/// A stored result file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEntry {
    pub namespace: Namespace,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Headline metrics of one benchmark result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BenchmarkHeadline {
    pub name: String,
    pub avg_latency: Option<f64>,
    pub successful_requests: Option<u64>,
    pub total_requests: Option<u64>,
    pub throughput: Option<f64>,
    pub transactions_per_second: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub time_to_first_token: Option<f64>,
}

/// Digest of one monitor result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorHeadline {
    pub name: String,
    pub samples: usize,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub avg_cpu: Option<f64>,
    pub avg_memory: Option<f64>,
    pub last_cpu: Option<f64>,
    pub last_memory: Option<f64>,
    pub last_gpu_util: Option<f64>,
    pub service_metric_count: usize,
    pub sample_errors: usize,
}

/// A result file that could not be summarized
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedResult {
    pub name: String,
    pub reason: String,
}

/// Every result recorded for one source job
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub benchmarks: Vec<BenchmarkHeadline>,
    pub monitors: Vec<MonitorHeadline>,
    pub skipped: Vec<SkippedResult>,
}

impl JobSummary {
    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty() && self.monitors.is_empty() && self.skipped.is_empty()
    }
}

fn number_at(value: &Value, key: &str) -> Option<f64> {
    value
        .get("summary")
        .and_then(|s| s.get(key))
        .or_else(|| value.get(key))
        .and_then(Value::as_f64)
}

fn count_at(value: &Value, key: &str) -> Option<u64> {
    value
        .get("summary")
        .and_then(|s| s.get(key))
        .or_else(|| value.get(key))
        .and_then(Value::as_u64)
}

/// Pull headline metrics out of a benchmark payload. Metrics are looked up in
/// `summary` first and then at the top level.
pub fn benchmark_headline(name: &str, payload: &Value) -> Result<BenchmarkHeadline, String> {
    if !payload.is_object() {
        return Err("benchmark result is not a JSON object".to_string());
    }
    Ok(BenchmarkHeadline {
        name: name.to_string(),
        avg_latency: number_at(payload, "avg_latency"),
        successful_requests: count_at(payload, "successful_requests"),
        total_requests: count_at(payload, "total_requests"),
        throughput: number_at(payload, "throughput"),
        transactions_per_second: number_at(payload, "transactions_per_second"),
        tokens_per_second: number_at(payload, "tokens_per_second"),
        time_to_first_token: number_at(payload, "time_to_first_token"),
    })
}

fn system_metric(sample: &Value, key: &str) -> Option<f64> {
    sample.get("system").and_then(|s| s.get(key)).and_then(Value::as_f64)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Digest a monitor payload (an ordered array of samples)
pub fn monitor_headline(name: &str, payload: &Value) -> Result<MonitorHeadline, String> {
    let samples = payload
        .as_array()
        .ok_or_else(|| "monitor result is not a JSON array".to_string())?;

    let timestamp_of = |sample: Option<&Value>| {
        sample
            .and_then(|s| s.get("timestamp"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let recent = &samples[samples.len().saturating_sub(RECENT_SAMPLES)..];
    let cpu: Vec<f64> = recent.iter().filter_map(|s| system_metric(s, "cpu_usage")).collect();
    let memory: Vec<f64> = recent.iter().filter_map(|s| system_metric(s, "memory_usage")).collect();

    let last = samples.last();
    let sample_errors = samples
        .iter()
        .filter(|s| {
            ["system", "gpu", "service"]
                .iter()
                .any(|section| s.get(section).and_then(|v| v.get("error")).is_some())
        })
        .count();

    Ok(MonitorHeadline {
        name: name.to_string(),
        samples: samples.len(),
        first_timestamp: timestamp_of(samples.first()),
        last_timestamp: timestamp_of(last),
        avg_cpu: mean(&cpu),
        avg_memory: mean(&memory),
        last_cpu: last.and_then(|s| system_metric(s, "cpu_usage")),
        last_memory: last.and_then(|s| system_metric(s, "memory_usage")),
        last_gpu_util: last
            .and_then(|s| s.get("gpu"))
            .and_then(|g| g.get("gpu_util"))
            .and_then(Value::as_f64),
        service_metric_count: last
            .and_then(|s| s.get("service"))
            .and_then(Value::as_object)
            .map_or(0, |m| m.len()),
        sample_errors,
    })
}

/// ResultStore writes and reads result files under `<root>/<namespace>/`
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.dir_name())
    }

    pub fn path_for(&self, namespace: Namespace, identity: &str) -> PathBuf {
        self.namespace_dir(namespace).join(format!("{}.json", identity))
    }

    /// Persist `payload` as `<identity>.json`. Never overwrites an existing result.
    #[instrument(skip(self, payload))]
    pub async fn write(
        &self,
        namespace: Namespace,
        identity: &str,
        payload: &Value,
    ) -> Result<PathBuf, ResultStoreError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir).await.map_err(|e| {
            ResultStoreError::WriteFailed(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let path = self.path_for(namespace, identity);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ResultStoreError::AlreadyExists(path.display().to_string()));
        }

        let data = serde_json::to_vec_pretty(payload)
            .map_err(|e| ResultStoreError::WriteFailed(format!("Failed to serialize result: {}", e)))?;

        let tmp_path = dir.join(format!(".{}.json.tmp", identity));
        fs::write(&tmp_path, &data).await.map_err(|e| {
            ResultStoreError::WriteFailed(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ResultStoreError::WriteFailed(format!(
                "Failed to move result into place at {}: {}",
                path.display(),
                e
            )));
        }

        info!(path = %path.display(), bytes = data.len(), "Result written");
        Ok(path)
    }

    /// Locate a result by path, file name, or identity
    pub async fn locate(&self, path_or_identity: &str) -> Result<PathBuf, ResultStoreError> {
        let direct = PathBuf::from(path_or_identity);
        if fs::try_exists(&direct).await.unwrap_or(false) {
            return Ok(direct);
        }

        let file_name = if path_or_identity.ends_with(".json") {
            path_or_identity.to_string()
        } else {
            format!("{}.json", path_or_identity)
        };
        for namespace in Namespace::ALL {
            let candidate = self.namespace_dir(namespace).join(&file_name);
            if fs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(candidate);
            }
        }

        Err(ResultStoreError::NotFound(path_or_identity.to_string()))
    }

    /// Read and parse a result file
    pub async fn read(&self, path_or_identity: &str) -> Result<(PathBuf, Value), ResultStoreError> {
        let path = self.locate(path_or_identity).await?;
        let bytes = fs::read(&path).await.map_err(|e| ResultStoreError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let value = serde_json::from_slice(&bytes).map_err(|e| ResultStoreError::Unreadable {
            path: path.display().to_string(),
            reason: format!("invalid JSON: {}", e),
        })?;
        Ok((path, value))
    }

    /// Result files, sorted by namespace then name. Missing directories are empty.
    pub async fn list(&self, namespace: Option<Namespace>) -> Result<Vec<ResultEntry>, ResultStoreError> {
        let namespaces: Vec<Namespace> = match namespace {
            Some(ns) => vec![ns],
            None => Namespace::ALL.to_vec(),
        };

        let mut entries = Vec::new();
        for ns in namespaces {
            let dir = self.namespace_dir(ns);
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ResultStoreError::FileSystem(format!(
                        "Failed to list {}: {}",
                        dir.display(),
                        e
                    )))
                }
            };

            let mut found = Vec::new();
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| ResultStoreError::FileSystem(e.to_string()))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".json") || name.starts_with('.') {
                    continue;
                }
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| ResultStoreError::FileSystem(e.to_string()))?;
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                found.push(ResultEntry {
                    namespace: ns,
                    name,
                    path: entry.path(),
                    size_bytes: metadata.len(),
                    modified,
                });
            }
            found.sort_by(|a, b| a.name.cmp(&b.name));
            entries.extend(found);
        }

        debug!(count = entries.len(), "Listed results");
        Ok(entries)
    }

    /// Aggregate every benchmark and monitor result recorded for `job_id`.
    ///
    /// Files are matched on the exact job id segment of their identity. Files that
    /// cannot be read or have the wrong shape are listed in `skipped`.
    #[instrument(skip(self))]
    pub async fn summarize(&self, job_id: &str) -> Result<JobSummary, ResultStoreError> {
        let mut summary = JobSummary {
            job_id: job_id.to_string(),
            ..Default::default()
        };

        for entry in self.list(None).await? {
            let identity = entry.name.trim_end_matches(".json");
            let belongs = parse_measurement_identity(identity)
                .map_or(false, |(_, source_job, _)| source_job == job_id);
            if !belongs {
                continue;
            }

            let parsed = match fs::read(&entry.path).await {
                Ok(bytes) => serde_json::from_slice::<Value>(&bytes).map_err(|e| format!("invalid JSON: {}", e)),
                Err(e) => Err(e.to_string()),
            };
            let outcome = parsed.and_then(|value| match entry.namespace {
                Namespace::Benchmarks => benchmark_headline(&entry.name, &value).map(|h| summary.benchmarks.push(h)),
                Namespace::Monitoring => monitor_headline(&entry.name, &value).map(|h| summary.monitors.push(h)),
            });

            if let Err(reason) = outcome {
                warn!(file = %entry.name, reason = %reason, "Skipping unreadable result");
                summary.skipped.push(SkippedResult {
                    name: entry.name.clone(),
                    reason,
                });
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());

        let path = store
            .write(Namespace::Benchmarks, "ollama_latency_1_20250101-000000-000", &json!({"a": 1}))
            .await
            .unwrap();
        assert!(path.ends_with("benchmarks/ollama_latency_1_20250101-000000-000.json"));

        let again = store
            .write(Namespace::Benchmarks, "ollama_latency_1_20250101-000000-000", &json!({"a": 2}))
            .await;
        assert!(matches!(again, Err(ResultStoreError::AlreadyExists(_))));

        let (_, value) = store.read("ollama_latency_1_20250101-000000-000").await.unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        store
            .write(Namespace::Monitoring, "ollama_2_20250101-000000-000", &json!([]))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("monitoring"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ollama_2_20250101-000000-000.json"]);
    }

    #[tokio::test]
    async fn test_read_by_path_and_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        let path = store
            .write(Namespace::Monitoring, "chroma_5_20250101-000000-000", &json!([]))
            .await
            .unwrap();

        assert!(store.read(path.to_str().unwrap()).await.is_ok());
        assert!(store.read("chroma_5_20250101-000000-000.json").await.is_ok());
        assert!(matches!(
            store.read("missing").await,
            Err(ResultStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_reports_size_and_skips_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        assert!(store.list(None).await.unwrap().is_empty());

        store
            .write(Namespace::Benchmarks, "pg_3_20250101-000000-000", &json!({"summary": {}}))
            .await
            .unwrap();
        let entries = store.list(Some(Namespace::Benchmarks)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].size_bytes > 0);
        assert!(store.list(Some(Namespace::Monitoring)).await.unwrap().is_empty());
    }

    #[test]
    fn test_benchmark_headline_prefers_summary() {
        let payload = json!({
            "metadata": {"benchmark": "ollama_latency"},
            "summary": {"avg_latency": 1.25, "successful_requests": 9, "total_requests": 10},
            "throughput": 3.5
        });
        let headline = benchmark_headline("x.json", &payload).unwrap();
        assert_eq!(headline.avg_latency, Some(1.25));
        assert_eq!(headline.successful_requests, Some(9));
        assert_eq!(headline.total_requests, Some(10));
        assert_eq!(headline.throughput, Some(3.5));
        assert!(benchmark_headline("x.json", &json!([1, 2])).is_err());
    }

    #[test]
    fn test_monitor_headline_averages_recent_samples() {
        let samples: Vec<Value> = (0..7)
            .map(|i| {
                json!({
                    "timestamp": format!("t{}", i),
                    "system": {"cpu_usage": i as f64 * 10.0, "memory_usage": 50.0},
                    "gpu": {},
                    "service": {"error": "timeout"}
                })
            })
            .collect();
        let headline = monitor_headline("m.json", &Value::Array(samples)).unwrap();
        assert_eq!(headline.samples, 7);
        assert_eq!(headline.first_timestamp.as_deref(), Some("t0"));
        assert_eq!(headline.last_timestamp.as_deref(), Some("t6"));
        // Last five samples: 20, 30, 40, 50, 60
        assert_eq!(headline.avg_cpu, Some(40.0));
        assert_eq!(headline.avg_memory, Some(50.0));
        assert_eq!(headline.sample_errors, 7);
        assert!(monitor_headline("m.json", &json!({})).is_err());
    }
}
