//! CLI definitions for `aif`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use aif_common::models::JobType;
use aif_common::results::Namespace;
use clap::{Parser, Subcommand};
use tracing::warn;

/// AI Factory job lifecycle and measurement orchestrator.
#[derive(Parser)]
#[command(name = "aif")]
#[command(about = "Deploy services on a Slurm cluster and measure them")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration directory (default.toml, local.toml)
    #[arg(short, long, default_value = "configs", env = "AIF_CONFIG_DIR", global = true)]
    pub config: PathBuf,

    /// Log level, overriding the configured one
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// One line typed into the interactive shell
#[derive(Parser)]
#[command(name = "aif", no_binary_name = true, disable_version_flag = true)]
pub(crate) struct ShellLine {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Service lifecycle commands
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },

    /// Benchmark commands
    Benchmark {
        #[command(subcommand)]
        action: BenchmarkAction,
    },

    /// Monitor commands
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },

    /// Stored result commands
    Results {
        #[command(subcommand)]
        action: ResultsAction,
    },

    /// Job registry commands
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Interactive session; monitors keep running while you type
    Shell,
}

#[derive(Subcommand)]
pub(crate) enum ServiceAction {
    /// Submit a service, wait for its node, and probe it once
    Start {
        /// Service label
        label: String,

        /// Parameter override, repeatable
        #[arg(long = "override", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// Cancel a service job
    Stop {
        job_id: String,
    },

    /// List service definitions
    List,

    /// Show the scheduler's view of your jobs
    Status,

    /// Show the scheduler attributes of one job
    Check {
        job_id: String,
    },

    /// Probe a started service again
    Health {
        job_id: String,
    },

    /// Tail a job's output file
    Logs {
        job_id: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Subcommand)]
pub(crate) enum BenchmarkAction {
    /// Run a benchmark against the node of a service job
    Run {
        /// Benchmark label
        label: String,

        /// Service job id
        job_id: String,

        /// Parameter override, repeatable
        #[arg(long = "override", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// List benchmark definitions
    List,
}

#[derive(Subcommand)]
pub(crate) enum MonitorAction {
    /// Sample host and service metrics for a service job
    Start {
        /// Service label or kind
        label: String,

        /// Service job id
        job_id: String,

        /// Seconds between samples
        #[arg(long)]
        interval: Option<u64>,

        /// Total seconds to monitor
        #[arg(long)]
        duration: Option<u64>,
    },

    /// List tracked monitors
    List,

    /// Stop tracking a monitor
    Stop {
        task_id: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum ResultsAction {
    /// List stored results
    List {
        /// benchmarks or monitoring
        #[arg(long)]
        namespace: Option<Namespace>,
    },

    /// Print one result
    Show {
        /// Path, file name, or identity
        result: String,
    },

    /// Aggregate every result of a job
    Summary {
        job_id: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List registered jobs
    List {
        /// service, benchmark, or monitor
        #[arg(long = "type")]
        job_type: Option<JobType>,
    },

    /// Forget one job
    Remove {
        job_id: String,
    },

    /// Forget every job
    Clear,
}

/// Turn repeated `KEY=VALUE` overrides into a map. Malformed entries are
/// warned about and skipped.
pub(crate) fn parse_overrides(raw: &[String]) -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    for entry in raw {
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                overrides.insert(key.trim().to_string(), value.to_string());
            }
            _ => warn!(entry = %entry, "Ignoring malformed override, expected KEY=VALUE"),
        }
    }
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides_skips_malformed() {
        let raw = vec![
            "model=mistral".to_string(),
            "novalue".to_string(),
            "=orphan".to_string(),
            "prompt=a=b".to_string(),
        ];
        let overrides = parse_overrides(&raw);
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides["model"], "mistral");
        assert_eq!(overrides["prompt"], "a=b");
    }

    #[test]
    fn test_repeated_override_flags() {
        let cli = Cli::try_parse_from([
            "aif",
            "service",
            "start",
            "ollama",
            "--override",
            "model=llama3",
            "--override",
            "time=01:00:00",
        ])
        .unwrap();
        match cli.command {
            Commands::Service {
                action: ServiceAction::Start { label, overrides },
            } => {
                assert_eq!(label, "ollama");
                assert_eq!(overrides.len(), 2);
            }
            _ => panic!("expected service start"),
        }
    }

    #[test]
    fn test_shell_line_has_no_binary_name() {
        let line = ShellLine::try_parse_from(["monitor", "start", "ollama", "42", "--interval", "2"]).unwrap();
        assert!(matches!(
            line.command,
            Commands::Monitor {
                action: MonitorAction::Start {
                    interval: Some(2),
                    ..
                }
            }
        ));
    }

    #[test]
    fn test_namespace_and_job_type_filters_parse() {
        let cli = Cli::try_parse_from(["aif", "results", "list", "--namespace", "monitoring"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Results {
                action: ResultsAction::List {
                    namespace: Some(Namespace::Monitoring)
                }
            }
        ));

        assert!(Cli::try_parse_from(["aif", "jobs", "list", "--type", "cronjob"]).is_err());
    }
}
