// Slurm implementation of the scheduler gateway (sbatch, scontrol, scancel, squeue)

use crate::config::SchedulerConfig;
use crate::errors::SchedulerError;
use crate::gateway::{JobAttributes, SchedulerGateway, SubmitRequest};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Output;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

fn submission_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Submitted batch job (\d+)").expect("static regex is valid"))
}

/// Extract the job id from sbatch's free-form output
pub fn parse_submission_output(stdout: &str) -> Option<String> {
    submission_regex()
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse `scontrol show job` output into key/value attributes.
///
/// Tokens are whitespace separated `Key=Value` pairs; a value is everything after
/// the first `=`.
pub fn parse_scontrol_output(stdout: &str) -> JobAttributes {
    let fields: BTreeMap<String, String> = stdout
        .split_whitespace()
        .filter_map(|item| item.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    JobAttributes::new(fields, stdout)
}

/// SlurmGateway shells out to the Slurm client commands
pub struct SlurmGateway {
    commands: SchedulerConfig,
}

impl SlurmGateway {
    pub fn new(commands: SchedulerConfig) -> Self {
        Self { commands }
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        environment: Option<&BTreeMap<String, String>>,
    ) -> Result<Output, std::io::Error> {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(env) = environment {
            command.envs(env);
        }
        debug!(program = program, args = ?args, "Running scheduler command");
        command.output().await
    }

    fn unavailable(program: &str, e: &std::io::Error) -> SchedulerError {
        if e.kind() == ErrorKind::NotFound {
            SchedulerError::CommandUnavailable(format!(
                "'{}' not found; is this a Slurm login node?",
                program
            ))
        } else {
            SchedulerError::CommandUnavailable(format!("'{}' could not be run: {}", program, e))
        }
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl SchedulerGateway for SlurmGateway {
    #[instrument(skip(self, request), fields(script = %request.script.display()))]
    async fn submit(&self, request: &SubmitRequest) -> Result<String, SchedulerError> {
        let program = &self.commands.sbatch_command;
        let mut args = request.args.clone();
        args.push(request.script.to_string_lossy().into_owned());

        let output = self
            .run(program, &args, Some(&request.environment))
            .await
            .map_err(|e| Self::unavailable(program, &e))?;

        if !output.status.success() {
            return Err(SchedulerError::SubmissionFailed(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr_of(&output)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_submission_output(&stdout)
            .ok_or_else(|| SchedulerError::UnparseableSubmission(stdout.trim().to_string()))?;

        info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    #[instrument(skip(self))]
    async fn query_status(&self, job_id: &str) -> Result<JobAttributes, SchedulerError> {
        let program = &self.commands.scontrol_command;
        let args = vec!["show".to_string(), "job".to_string(), job_id.to_string()];

        let output = self
            .run(program, &args, None)
            .await
            .map_err(|e| Self::unavailable(program, &e))?;

        if !output.status.success() {
            return Err(SchedulerError::QueryFailed {
                job_id: job_id.to_string(),
                reason: stderr_of(&output),
            });
        }

        Ok(parse_scontrol_output(&String::from_utf8_lossy(&output.stdout)))
    }

    #[instrument(skip(self))]
    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let program = &self.commands.scancel_command;
        let output = self
            .run(program, &[job_id.to_string()], None)
            .await
            .map_err(|e| Self::unavailable(program, &e))?;

        if !output.status.success() {
            let reason = stderr_of(&output);
            warn!(job_id = %job_id, reason = %reason, "Cancellation rejected");
            return Err(SchedulerError::CancelFailed {
                job_id: job_id.to_string(),
                reason,
            });
        }

        info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    async fn list_mine(&self) -> Result<String, SchedulerError> {
        let program = &self.commands.squeue_command;
        let output = self
            .run(program, &["--me".to_string()], None)
            .await
            .map_err(|e| Self::unavailable(program, &e))?;

        if !output.status.success() {
            return Err(SchedulerError::QueryFailed {
                job_id: "*".to_string(),
                reason: stderr_of(&output),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
