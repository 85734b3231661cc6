//! Command handlers. Operator output goes to stdout; diagnostics go to the log.

use std::collections::BTreeMap;

use aif_common::bootstrap::AppContext;
use aif_common::errors::OrchestratorError;
use aif_common::measurement::TaskHandle;
use aif_common::models::{MeasurementKind, MeasurementTask, ServiceState};
use aif_common::results::{benchmark_headline, monitor_headline, JobSummary};
use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use crate::cli::{
    parse_overrides, BenchmarkAction, Commands, JobsAction, MonitorAction, ResultsAction,
    ServiceAction,
};

/// Monitors launched during one process; they must finish before it exits
#[derive(Default)]
pub(crate) struct Session {
    monitors: Vec<TaskHandle>,
}

impl Session {
    pub(crate) fn running(&self) -> usize {
        self.monitors.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every monitor launched in this session
    pub(crate) async fn wait_all(&mut self) {
        for handle in self.monitors.drain(..) {
            let task_id = handle.task_id().to_string();
            match handle.wait().await {
                Ok(task) => print_task_outcome(&task),
                Err(e) => println!("Monitor {} did not finish: {}", task_id, e),
            }
        }
    }
}

fn print_task_outcome(task: &MeasurementTask) {
    match &task.result_path {
        Some(path) => println!("{} {} {}: {}", task.kind, task.task_id, task.state, path),
        None => println!("{} {} {}", task.kind, task.task_id, task.state),
    }
}

fn or_dash(value: Option<impl ToString>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v))
}

pub(crate) async fn execute(ctx: &AppContext, command: Commands, session: &mut Session) -> Result<()> {
    match command {
        Commands::Service { action } => service(ctx, action).await,
        Commands::Benchmark { action } => benchmark(ctx, action).await,
        Commands::Monitor { action } => monitor(ctx, action, session).await,
        Commands::Results { action } => results(ctx, action).await,
        Commands::Jobs { action } => jobs(ctx, action).await,
        Commands::Shell => {
            println!("Already in a shell session");
            Ok(())
        }
    }
}

async fn service(ctx: &AppContext, action: ServiceAction) -> Result<()> {
    let orchestrator = &ctx.orchestrator;
    match action {
        ServiceAction::Start { label, overrides } => {
            let overrides = parse_overrides(&overrides);
            let outcome = match orchestrator.start(&label, &overrides).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_submission_failure() => {
                    return Err(e).context(format!("Could not submit service '{}'", label));
                }
                Err(e) => return Err(e.into()),
            };

            match outcome.state {
                ServiceState::Healthy => println!(
                    "Service '{}' is healthy: job {} on {}",
                    label,
                    outcome.job_id,
                    or_dash(outcome.target.as_ref())
                ),
                ServiceState::Unhealthy => println!(
                    "Service '{}' is running as job {} on {} but failed its readiness check",
                    label,
                    outcome.job_id,
                    or_dash(outcome.target.as_ref())
                ),
                ServiceState::Unreachable => println!(
                    "Service '{}' was submitted as job {} but never became reachable: {}",
                    label,
                    outcome.job_id,
                    or_dash(outcome.resolution_error.as_ref())
                ),
                other => println!("Service '{}' job {}: {}", label, outcome.job_id, other),
            }
            Ok(())
        }
        ServiceAction::Stop { job_id } => {
            orchestrator.stop(&job_id).await?;
            println!("Cancelled job {}", job_id);
            Ok(())
        }
        ServiceAction::List => {
            println!("{:<20} {:<10} {:<28} DESCRIPTION", "LABEL", "KIND", "SCRIPT");
            for (label, recipe) in orchestrator.list_definitions() {
                println!(
                    "{:<20} {:<10} {:<28} {}",
                    label,
                    recipe.kind,
                    recipe.script,
                    recipe.description.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        ServiceAction::Status => {
            print!("{}", orchestrator.list_running().await?);
            Ok(())
        }
        ServiceAction::Check { job_id } => {
            let attributes = orchestrator.check(&job_id).await?;
            for (key, value) in attributes.fields() {
                println!("{:<16} {}", key, value);
            }
            Ok(())
        }
        ServiceAction::Health { job_id } => {
            let state = orchestrator.recheck(&job_id).await?;
            println!("Job {} is {}", job_id, state);
            Ok(())
        }
        ServiceAction::Logs { job_id, lines } => {
            match orchestrator.logs(&job_id, lines).await {
                Ok(lines) => lines.iter().for_each(|line| println!("{}", line)),
                Err(OrchestratorError::LogUnavailable(reason)) => {
                    println!("No output available for job {}: {}", job_id, reason)
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
    }
}

async fn benchmark(ctx: &AppContext, action: BenchmarkAction) -> Result<()> {
    match action {
        BenchmarkAction::Run {
            label,
            job_id,
            overrides,
        } => {
            let overrides = parse_overrides(&overrides);
            let handle = ctx
                .measurements
                .launch(MeasurementKind::Benchmark, &label, &job_id, &overrides)
                .await
                .with_context(|| format!("Benchmark '{}' against job {} failed", label, job_id))?;
            let task = handle.wait().await?;
            print_task_outcome(&task);

            if let Some(path) = &task.result_path {
                let (_, payload) = ctx.results.read(path).await?;
                if let Ok(headline) = benchmark_headline(&task.task_id, &payload) {
                    print_benchmark_rows(std::slice::from_ref(&headline));
                }
            }
            Ok(())
        }
        BenchmarkAction::List => {
            println!("{:<24} {:<10} {:<22} DESCRIPTION", "LABEL", "KIND", "BENCHMARK");
            for (label, recipe) in ctx.measurements.benchmark_definitions() {
                println!(
                    "{:<24} {:<10} {:<22} {}",
                    label,
                    recipe.kind,
                    recipe.benchmark,
                    recipe.description.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
    }
}

async fn monitor(ctx: &AppContext, action: MonitorAction, session: &mut Session) -> Result<()> {
    match action {
        MonitorAction::Start {
            label,
            job_id,
            interval,
            duration,
        } => {
            let mut params = BTreeMap::new();
            if let Some(interval) = interval {
                params.insert("interval".to_string(), interval.to_string());
            }
            if let Some(duration) = duration {
                params.insert("duration".to_string(), duration.to_string());
            }

            let handle = ctx
                .measurements
                .launch(MeasurementKind::Monitor, &label, &job_id, &params)
                .await
                .with_context(|| format!("Could not start monitor '{}' for job {}", label, job_id))?;
            let task = handle.current();
            println!(
                "Monitor {} started on {} (every {}s for {}s)",
                task.task_id,
                task.target,
                task.interval.as_secs(),
                task.duration.unwrap_or_default().as_secs()
            );
            session.monitors.push(handle);
            Ok(())
        }
        MonitorAction::List => {
            let tasks = ctx.measurements.list_tasks();
            if tasks.is_empty() {
                println!("No monitors tracked");
                return Ok(());
            }
            println!("{:<44} {:<10} {:<12} {:<20} RESULT", "TASK", "STATE", "TARGET", "STARTED");
            for task in tasks {
                println!(
                    "{:<44} {:<10} {:<12} {:<20} {}",
                    task.task_id,
                    task.state,
                    task.target,
                    task.started_at.format("%Y-%m-%d %H:%M:%S"),
                    or_dash(task.result_path.as_ref())
                );
            }
            Ok(())
        }
        MonitorAction::Stop { task_id } => {
            if ctx.measurements.cancel(&task_id) {
                println!("Stopped tracking {}; samples collected so far are still saved when it ends", task_id);
            } else {
                println!("Monitor {} is not tracked", task_id);
            }
            Ok(())
        }
    }
}

fn print_benchmark_rows(rows: &[aif_common::results::BenchmarkHeadline]) {
    println!(
        "{:<48} {:>12} {:>10} {:>14} {:>10} {:>10}",
        "BENCHMARK", "AVG LATENCY", "OK/TOTAL", "THROUGHPUT", "TOKENS/S", "TTFT"
    );
    for b in rows {
        let requests = match (b.successful_requests, b.total_requests) {
            (Some(ok), Some(total)) => format!("{}/{}", ok, total),
            _ => "-".to_string(),
        };
        println!(
            "{:<48} {:>12} {:>10} {:>14} {:>10} {:>10}",
            b.name,
            fmt_metric(b.avg_latency),
            requests,
            fmt_metric(b.throughput.or(b.transactions_per_second)),
            fmt_metric(b.tokens_per_second),
            fmt_metric(b.time_to_first_token)
        );
    }
}

fn print_summary(summary: &JobSummary) {
    if summary.is_empty() {
        println!("No results for job {}", summary.job_id);
        return;
    }
    println!("Results for job {}", summary.job_id);
    if !summary.benchmarks.is_empty() {
        println!();
        print_benchmark_rows(&summary.benchmarks);
    }
    if !summary.monitors.is_empty() {
        println!();
        println!(
            "{:<48} {:>8} {:>9} {:>9} {:>8}",
            "MONITOR", "SAMPLES", "AVG CPU", "AVG MEM", "ERRORS"
        );
        for m in &summary.monitors {
            println!(
                "{:<48} {:>8} {:>9} {:>9} {:>8}",
                m.name,
                m.samples,
                fmt_metric(m.avg_cpu),
                fmt_metric(m.avg_memory),
                m.sample_errors
            );
        }
    }
    for skipped in &summary.skipped {
        println!("Skipped {}: {}", skipped.name, skipped.reason);
    }
}

async fn results(ctx: &AppContext, action: ResultsAction) -> Result<()> {
    match action {
        ResultsAction::List { namespace } => {
            let entries = ctx.results.list(namespace).await?;
            if entries.is_empty() {
                println!("No results under {}", ctx.results.root().display());
                return Ok(());
            }
            println!("{:<12} {:<52} {:>10} MODIFIED", "NAMESPACE", "NAME", "BYTES");
            for entry in entries {
                println!(
                    "{:<12} {:<52} {:>10} {}",
                    entry.namespace,
                    entry.name,
                    entry.size_bytes,
                    entry.modified.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        ResultsAction::Show { result } => {
            let (path, payload) = ctx.results.read(&result).await?;
            if payload.is_array() {
                print_monitor_digest(&path.display().to_string(), &payload);
            } else {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
            Ok(())
        }
        ResultsAction::Summary { job_id } => {
            let summary = ctx.results.summarize(&job_id).await?;
            print_summary(&summary);
            Ok(())
        }
    }
}

fn print_monitor_digest(name: &str, payload: &Value) {
    let Ok(digest) = monitor_headline(name, payload) else {
        return;
    };
    println!("{}", name);
    println!("  samples          {}", digest.samples);
    println!("  first sample     {}", or_dash(digest.first_timestamp.as_ref()));
    println!("  last sample      {}", or_dash(digest.last_timestamp.as_ref()));
    println!("  last cpu %       {}", fmt_metric(digest.last_cpu));
    println!("  last memory %    {}", fmt_metric(digest.last_memory));
    println!("  last gpu util %  {}", fmt_metric(digest.last_gpu_util));
    println!("  service metrics  {}", digest.service_metric_count);
    println!("  sample errors    {}", digest.sample_errors);
}

async fn jobs(ctx: &AppContext, action: JobsAction) -> Result<()> {
    match action {
        JobsAction::List { job_type } => {
            let mut records = ctx.registry.list(job_type).await?;
            records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            if records.is_empty() {
                println!("No jobs registered");
                return Ok(());
            }
            println!(
                "{:<44} {:<10} {:<20} {:<12} {:<10} PARENT",
                "JOB", "TYPE", "LABEL", "TARGET", "STATUS"
            );
            for r in records {
                println!(
                    "{:<44} {:<10} {:<20} {:<12} {:<10} {}",
                    r.job_id,
                    r.job_type,
                    r.label,
                    or_dash(r.target.as_ref()),
                    r.status,
                    or_dash(r.parent_job_id.as_ref())
                );
            }
            Ok(())
        }
        JobsAction::Remove { job_id } => {
            if ctx.registry.remove(&job_id).await? {
                println!("Removed job {}", job_id);
            } else {
                println!("Job {} is not registered", job_id);
            }
            Ok(())
        }
        JobsAction::Clear => {
            ctx.registry.clear().await?;
            info!(registry = %ctx.registry.path().display(), "Job registry cleared");
            println!("Job registry cleared");
            Ok(())
        }
    }
}
