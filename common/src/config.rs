// Configuration management with layered configuration (defaults, file, env)

use crate::models::{BenchmarkKind, ServiceKind};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parameter keys routed to the scheduler submission instead of the job environment
pub const INFRASTRUCTURE_KEYS: &[&str] = &[
    "partition",
    "nodes",
    "ntasks",
    "cpus_per_task",
    "mem",
    "time",
    "gres",
    "account",
    "qos",
    "constraint",
    "job_name",
];

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathsConfig,
    pub scheduler: SchedulerConfig,
    pub services: BTreeMap<String, ServiceRecipe>,
    pub benchmarks: BTreeMap<String, BenchmarkRecipe>,
    pub monitoring: MonitoringConfig,
    pub probes: ProbeConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub registry_file: PathBuf,
    pub results_dir: PathBuf,
    pub scripts_dir: PathBuf,
}

impl PathsConfig {
    /// Absolute-or-relative path of a service's submission script
    pub fn script_path(&self, recipe: &ServiceRecipe) -> PathBuf {
        let script = Path::new(&recipe.script);
        if script.is_absolute() {
            script.to_path_buf()
        } else {
            self.scripts_dir.join(script)
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            registry_file: PathBuf::from(".aif_jobs.json"),
            results_dir: PathBuf::from("results"),
            scripts_dir: PathBuf::from("services"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_wait_seconds: u64,
    pub poll_interval_seconds: u64,
    pub sbatch_command: String,
    pub scontrol_command: String,
    pub scancel_command: String,
    pub squeue_command: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_wait_seconds: 300,
            poll_interval_seconds: 5,
            sbatch_command: "sbatch".to_string(),
            scontrol_command: "scontrol".to_string(),
            scancel_command: "scancel".to_string(),
            squeue_command: "squeue".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// A deployable service definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecipe {
    pub kind: ServiceKind,
    pub script: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_params: BTreeMap<String, String>,
}

/// A benchmark definition run against a service of `kind`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRecipe {
    pub kind: ServiceKind,
    pub benchmark: BenchmarkKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub default_interval_seconds: u64,
    pub default_duration_seconds: u64,
    pub collector_timeout_seconds: u64,
    pub gpu_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            default_interval_seconds: 5,
            default_duration_seconds: 300,
            collector_timeout_seconds: 5,
            gpu_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub request_timeout_seconds: u64,
    pub slow_start_budget_seconds: u64,
    pub slow_start_poll_seconds: u64,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_database: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 120,
            slow_start_budget_seconds: 600,
            slow_start_poll_seconds: 10,
            postgres_user: "postgres".to_string(),
            postgres_password: "mysecretpassword".to_string(),
            postgres_database: "postgres".to_string(),
        }
    }
}

impl ProbeConfig {
    /// Connection URL for a postgres service listening on `host:port`
    pub fn postgres_url(&self, host: &str, port: u16) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres_user, self.postgres_password, host, port, self.postgres_database
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub pushgateway_endpoint: Option<String>,
    pub push_interval_seconds: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            pushgateway_endpoint: None,
            push_interval_seconds: 10,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("configs")
    }

    /// Load configuration from a specific directory.
    ///
    /// `default.*` and `local.*` may be TOML or YAML; both are optional.
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(config_dir.join("default")).required(false))
            // Not committed to git
            .add_source(File::from(config_dir.join("local")).required(false))
            .add_source(
                Environment::with_prefix("AIF")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.poll_interval_seconds == 0 {
            return Err("Scheduler poll_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.max_wait_seconds == 0 {
            return Err("Scheduler max_wait_seconds must be greater than 0".to_string());
        }
        if self.scheduler.poll_interval_seconds > self.scheduler.max_wait_seconds {
            return Err(
                "Scheduler poll_interval_seconds cannot exceed max_wait_seconds".to_string(),
            );
        }

        for (name, recipe) in &self.services {
            if recipe.script.trim().is_empty() {
                return Err(format!("Service '{}' has an empty script path", name));
            }
        }

        for (name, recipe) in &self.benchmarks {
            if recipe.benchmark.service_kind() != recipe.kind {
                return Err(format!(
                    "Benchmark '{}' runs {} against a {} service",
                    name, recipe.benchmark, recipe.kind
                ));
            }
        }

        if self.monitoring.default_interval_seconds == 0 {
            return Err("Monitoring default_interval_seconds must be greater than 0".to_string());
        }
        if self.probes.slow_start_poll_seconds == 0 {
            return Err("Probe slow_start_poll_seconds must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn script_path(&self, recipe: &ServiceRecipe) -> PathBuf {
        self.paths.script_path(recipe)
    }

    /// Service kind for a service label or a benchmark label
    pub fn kind_of(&self, label: &str) -> Option<ServiceKind> {
        self.services
            .get(label)
            .map(|r| r.kind)
            .or_else(|| self.benchmarks.get(label).map(|r| r.kind))
            .or_else(|| label.parse().ok())
    }
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        let mut services = BTreeMap::new();
        services.insert(
            "ollama".to_string(),
            ServiceRecipe {
                kind: ServiceKind::Ollama,
                script: "run_ollama_server.sh".to_string(),
                description: Some("Ollama LLM inference server".to_string()),
                default_params: params(&[
                    ("partition", "gpu"),
                    ("gres", "gpu:1"),
                    ("time", "02:00:00"),
                    ("model", "llama2"),
                ]),
            },
        );
        services.insert(
            "postgresql".to_string(),
            ServiceRecipe {
                kind: ServiceKind::Postgres,
                script: "run_postgresql_server.sh".to_string(),
                description: Some("PostgreSQL database server".to_string()),
                default_params: params(&[("time", "02:00:00")]),
            },
        );
        services.insert(
            "chroma".to_string(),
            ServiceRecipe {
                kind: ServiceKind::Chroma,
                script: "run_chroma_server.sh".to_string(),
                description: Some("ChromaDB vector store".to_string()),
                default_params: params(&[("time", "02:00:00")]),
            },
        );

        let mut benchmarks = BTreeMap::new();
        benchmarks.insert(
            "ollama_latency".to_string(),
            BenchmarkRecipe {
                kind: ServiceKind::Ollama,
                benchmark: BenchmarkKind::OllamaLatency,
                description: Some("Sequential generate requests, latency stats".to_string()),
                default_params: params(&[
                    ("model", "llama2"),
                    ("prompt", "In one short sentence, what is a supercomputer?"),
                    ("num_requests", "10"),
                ]),
            },
        );
        benchmarks.insert(
            "ollama_streaming".to_string(),
            BenchmarkRecipe {
                kind: ServiceKind::Ollama,
                benchmark: BenchmarkKind::OllamaStreaming,
                description: Some("Streaming generate, time to first token and tokens/s".to_string()),
                default_params: params(&[
                    ("model", "llama2"),
                    ("prompt", "Explain how a cluster scheduler works."),
                ]),
            },
        );
        benchmarks.insert(
            "postgres_throughput".to_string(),
            BenchmarkRecipe {
                kind: ServiceKind::Postgres,
                benchmark: BenchmarkKind::PostgresThroughput,
                description: Some("Row insert and read throughput".to_string()),
                default_params: params(&[("table_name", "aif_benchmark"), ("rows", "1000")]),
            },
        );
        benchmarks.insert(
            "postgres_transaction".to_string(),
            BenchmarkRecipe {
                kind: ServiceKind::Postgres,
                benchmark: BenchmarkKind::PostgresTransaction,
                description: Some("Explicit single-insert transactions per second".to_string()),
                default_params: params(&[("transactions", "1000")]),
            },
        );
        benchmarks.insert(
            "chroma_throughput".to_string(),
            BenchmarkRecipe {
                kind: ServiceKind::Chroma,
                benchmark: BenchmarkKind::ChromaThroughput,
                description: Some("Document add and get throughput".to_string()),
                default_params: params(&[
                    ("collection_name", "aif_benchmark"),
                    ("documents", "1000"),
                ]),
            },
        );
        benchmarks.insert(
            "chroma_query".to_string(),
            BenchmarkRecipe {
                kind: ServiceKind::Chroma,
                benchmark: BenchmarkKind::ChromaQuery,
                description: Some("Nearest-neighbour query latency".to_string()),
                default_params: params(&[
                    ("collection_name", "aif_benchmark_query"),
                    ("documents", "1000"),
                    ("n_results", "10"),
                ]),
            },
        );

        Self {
            paths: PathsConfig::default(),
            scheduler: SchedulerConfig::default(),
            services,
            benchmarks,
            monitoring: MonitoringConfig::default(),
            probes: ProbeConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
