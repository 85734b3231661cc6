// Metric sources for monitor samples: host (sysinfo, nvidia-smi) and per-service collectors

use crate::config::ProbeConfig;
use crate::errors::CollectorError;
use crate::models::ServiceKind;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System};
use tokio::process::Command;
use tracing::debug;

pub type MetricMap = Map<String, Value>;

/// Metrics of the machine running the monitor
#[async_trait]
pub trait HostMetricsSource: Send + Sync {
    async fn system(&self) -> Result<MetricMap, CollectorError>;

    /// GPU utilisation; empty when no GPU tooling is available
    async fn gpu(&self) -> MetricMap;
}

/// Service-specific metrics for one kind of service
#[async_trait]
pub trait ServiceMetricsCollector: Send + Sync {
    fn kind(&self) -> ServiceKind;

    async fn collect(&self, target: &str) -> Result<MetricMap, CollectorError>;
}

fn reqwest_error(e: reqwest::Error) -> CollectorError {
    if e.is_timeout() {
        CollectorError::Timeout
    } else if e.is_connect() {
        CollectorError::Connection(e.to_string())
    } else {
        CollectorError::Other(e.to_string())
    }
}

fn build_client(timeout: Duration) -> Result<Client, CollectorError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollectorError::Other(format!("Failed to create HTTP client: {}", e)))
}

// ============================================================================
// Host metrics
// ============================================================================

/// SysinfoHost reads CPU, memory, disk and network counters through `sysinfo`,
/// and GPU figures through `nvidia-smi` when enabled
pub struct SysinfoHost {
    system: Mutex<System>,
    gpu_enabled: bool,
}

impl SysinfoHost {
    pub fn new(gpu_enabled: bool) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            gpu_enabled,
        }
    }
}

#[async_trait]
impl HostMetricsSource for SysinfoHost {
    async fn system(&self) -> Result<MetricMap, CollectorError> {
        let (cpu_usage, memory_usage) = {
            let mut system = self
                .system
                .lock()
                .map_err(|_| CollectorError::Other("host metrics lock poisoned".to_string()))?;
            system.refresh_cpu_usage();
            system.refresh_memory();
            let total = system.total_memory();
            let memory_usage = if total > 0 {
                system.used_memory() as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            (system.global_cpu_usage() as f64, memory_usage)
        };

        let (mut read_bytes, mut written_bytes) = (0u64, 0u64);
        for disk in Disks::new_with_refreshed_list().list() {
            let usage = disk.usage();
            read_bytes += usage.total_read_bytes;
            written_bytes += usage.total_written_bytes;
        }

        let (mut received, mut transmitted, mut packets_recv, mut packets_sent) = (0u64, 0u64, 0u64, 0u64);
        for data in Networks::new_with_refreshed_list().list().values() {
            received += data.total_received();
            transmitted += data.total_transmitted();
            packets_recv += data.total_packets_received();
            packets_sent += data.total_packets_transmitted();
        }

        let mut metrics = MetricMap::new();
        metrics.insert("cpu_usage".to_string(), json!(round2(cpu_usage)));
        metrics.insert("memory_usage".to_string(), json!(round2(memory_usage)));
        metrics.insert(
            "disk_io".to_string(),
            json!({ "read_bytes": read_bytes, "write_bytes": written_bytes }),
        );
        metrics.insert(
            "net_io".to_string(),
            json!({
                "bytes_recv": received,
                "bytes_sent": transmitted,
                "packets_recv": packets_recv,
                "packets_sent": packets_sent,
            }),
        );
        Ok(metrics)
    }

    async fn gpu(&self) -> MetricMap {
        if !self.gpu_enabled {
            return MetricMap::new();
        }
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=utilization.gpu,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)).unwrap_or_default()
            }
            _ => MetricMap::new(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Parse the first line of `nvidia-smi --query-gpu=utilization.gpu,memory.used,memory.total`
pub fn parse_nvidia_smi(output: &str) -> Option<MetricMap> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let values: Vec<f64> = line
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    let [util, used, total] = values.as_slice() else {
        return None;
    };

    let mut metrics = MetricMap::new();
    metrics.insert("gpu_util".to_string(), json!(util));
    metrics.insert("gpu_mem_used".to_string(), json!(used));
    metrics.insert("gpu_mem_total".to_string(), json!(total));
    Some(metrics)
}

// ============================================================================
// Service collectors
// ============================================================================

/// Parse Prometheus text exposition into `series → value`. Comment lines and
/// values that are not numbers are skipped.
pub fn parse_prometheus_text(text: &str) -> MetricMap {
    let mut metrics = MetricMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // Label values may contain spaces; the series name ends at the closing brace
        let (series, rest) = match line.rfind('}') {
            Some(end) => (&line[..=end], &line[end + 1..]),
            None => match line.split_once(char::is_whitespace) {
                Some((series, rest)) => (series, rest),
                None => continue,
            },
        };
        let Some(value) = rest.split_whitespace().next() else {
            continue;
        };
        if let Ok(value) = value.parse::<f64>() {
            if let Some(number) = serde_json::Number::from_f64(value) {
                metrics.insert(series.to_string(), Value::Number(number));
            }
        }
    }
    metrics
}

/// Scrapes ollama's Prometheus `/metrics` endpoint
pub struct OllamaMetricsCollector {
    client: Client,
}

impl OllamaMetricsCollector {
    pub fn new(timeout: Duration) -> Result<Self, CollectorError> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl ServiceMetricsCollector for OllamaMetricsCollector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Ollama
    }

    async fn collect(&self, target: &str) -> Result<MetricMap, CollectorError> {
        let url = format!("{}/metrics", ServiceKind::Ollama.base_url(target));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(reqwest_error)?;
        let text = response.text().await.map_err(reqwest_error)?;
        Ok(parse_prometheus_text(&text))
    }
}

/// Chroma has no metrics endpoint; records heartbeat availability and latency
pub struct ChromaMetricsCollector {
    client: Client,
}

impl ChromaMetricsCollector {
    pub fn new(timeout: Duration) -> Result<Self, CollectorError> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl ServiceMetricsCollector for ChromaMetricsCollector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Chroma
    }

    async fn collect(&self, target: &str) -> Result<MetricMap, CollectorError> {
        let url = format!("{}/api/v1/heartbeat", ServiceKind::Chroma.base_url(target));
        let started = Instant::now();
        let response = self.client.get(&url).send().await.map_err(reqwest_error)?;
        let elapsed = started.elapsed();
        let status = response.status();

        let mut metrics = MetricMap::new();
        metrics.insert("heartbeat_status_code".to_string(), json!(status.as_u16()));
        metrics.insert("service_available".to_string(), json!(status.is_success()));
        metrics.insert(
            "response_time_ms".to_string(),
            json!(elapsed.as_secs_f64() * 1000.0),
        );
        if status.is_success() {
            if let Ok(Value::Object(body)) = response.json::<Value>().await {
                for (key, value) in body {
                    metrics.insert(format!("heartbeat_{}", key), value);
                }
            }
        }
        Ok(metrics)
    }
}

/// Reads database size, connection count and pg_stat_database counters
pub struct PostgresMetricsCollector {
    probes: ProbeConfig,
    timeout: Duration,
}

impl PostgresMetricsCollector {
    pub fn new(probes: &ProbeConfig, timeout: Duration) -> Self {
        Self {
            probes: probes.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl ServiceMetricsCollector for PostgresMetricsCollector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Postgres
    }

    async fn collect(&self, target: &str) -> Result<MetricMap, CollectorError> {
        let (host, port) = ServiceKind::Postgres.address(target);
        let started = Instant::now();
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.timeout)
            .connect(&self.probes.postgres_url(&host, port))
            .await
            .map_err(|e| match e {
                sqlx::Error::PoolTimedOut => CollectorError::Timeout,
                other => CollectorError::Connection(other.to_string()),
            })?;

        let mut metrics = MetricMap::new();
        metrics.insert(
            "connection_time_ms".to_string(),
            json!(started.elapsed().as_secs_f64() * 1000.0),
        );
        metrics.insert("service_available".to_string(), json!(true));

        let database = self.probes.postgres_database.clone();
        let stats = async {
            let size: i64 = sqlx::query_scalar("SELECT pg_database_size($1)")
                .bind(&database)
                .fetch_one(&pool)
                .await?;
            metrics.insert("database_size_bytes".to_string(), json!(size));
            metrics.insert(
                "database_size_mb".to_string(),
                json!(round2(size as f64 / (1024.0 * 1024.0))),
            );

            let connections: i64 = sqlx::query_scalar("SELECT count(*) FROM pg_stat_activity")
                .fetch_one(&pool)
                .await?;
            metrics.insert("active_connections".to_string(), json!(connections));

            let row = sqlx::query(
                "SELECT xact_commit, xact_rollback, blks_read, blks_hit \
                 FROM pg_stat_database WHERE datname = $1",
            )
            .bind(&database)
            .fetch_optional(&pool)
            .await?;
            if let Some(row) = row {
                let blocks_read: i64 = row.try_get("blks_read")?;
                let blocks_hit: i64 = row.try_get("blks_hit")?;
                metrics.insert(
                    "transactions_committed".to_string(),
                    json!(row.try_get::<i64, _>("xact_commit")?),
                );
                metrics.insert(
                    "transactions_rolled_back".to_string(),
                    json!(row.try_get::<i64, _>("xact_rollback")?),
                );
                metrics.insert("blocks_read".to_string(), json!(blocks_read));
                metrics.insert("blocks_hit".to_string(), json!(blocks_hit));
                let total = blocks_read + blocks_hit;
                if total > 0 {
                    metrics.insert(
                        "cache_hit_ratio".to_string(),
                        json!(round2(blocks_hit as f64 / total as f64 * 100.0)),
                    );
                }
            }
            Ok::<(), sqlx::Error>(())
        }
        .await;
        pool.close().await;

        stats.map_err(|e| CollectorError::Other(e.to_string()))?;
        Ok(metrics)
    }
}

/// Collector for each service kind, built once at start-up
pub fn build_collectors(
    probes: &ProbeConfig,
    timeout: Duration,
) -> Result<Vec<Arc<dyn ServiceMetricsCollector>>, CollectorError> {
    ServiceKind::ALL
        .into_iter()
        .map(|kind| -> Result<Arc<dyn ServiceMetricsCollector>, CollectorError> {
            Ok(match kind {
                ServiceKind::Ollama => Arc::new(OllamaMetricsCollector::new(timeout)?),
                ServiceKind::Postgres => Arc::new(PostgresMetricsCollector::new(probes, timeout)),
                ServiceKind::Chroma => Arc::new(ChromaMetricsCollector::new(timeout)?),
            })
        })
        .inspect(|c| {
            if let Ok(c) = c {
                debug!(kind = %c.kind(), "Metrics collector registered");
            }
        })
        .collect()
}
