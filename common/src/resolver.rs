// Node resolver: polls the scheduler until a job has an execution target

use crate::errors::ResolutionError;
use crate::gateway::{SchedulerGateway, SchedulerJobState};
use crate::telemetry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// TargetResolver turns a scheduler job id into the node it runs on
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, job_id: &str) -> Result<String, ResolutionError>;
}

/// NodeResolver polls `query_status` at a fixed interval.
///
/// Resolution ends when the job is RUNNING on a real node, when the job leaves the
/// PENDING / CONFIGURING / RUNNING states, when a status query fails, or when
/// `max_wait` has elapsed. There is no retry on a failed query.
pub struct NodeResolver {
    gateway: Arc<dyn SchedulerGateway>,
    max_wait: Duration,
    poll_interval: Duration,
}

impl NodeResolver {
    pub fn new(gateway: Arc<dyn SchedulerGateway>, max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            gateway,
            max_wait,
            poll_interval,
        }
    }

    pub fn with_defaults(gateway: Arc<dyn SchedulerGateway>) -> Self {
        Self::new(gateway, DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL)
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Resolve with explicit bounds instead of the configured ones
    #[instrument(skip(self), fields(max_wait_secs = max_wait.as_secs(), poll_secs = poll_interval.as_secs()))]
    pub async fn resolve_with(
        &self,
        job_id: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<String, ResolutionError> {
        let started = Instant::now();
        let mut polls: u32 = 0;

        let outcome = loop {
            polls += 1;
            let attributes = match self.gateway.query_status(job_id).await {
                Ok(attributes) => attributes,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Status query failed, aborting resolution");
                    break Err(ResolutionError::QueryFailed {
                        job_id: job_id.to_string(),
                        reason: e.to_string(),
                    });
                }
            };

            match attributes.state() {
                Some(SchedulerJobState::Running) => {
                    if let Some(target) = attributes.target() {
                        break Ok(target.to_string());
                    }
                    debug!(job_id = %job_id, polls, "Job running but node not yet reported");
                }
                Some(state) if state.is_waiting() => {
                    debug!(job_id = %job_id, state = %state, polls, "Job waiting for allocation");
                }
                other => {
                    let state = other.map_or_else(|| "UNKNOWN".to_string(), |s| s.to_string());
                    break Err(ResolutionError::Aborted {
                        job_id: job_id.to_string(),
                        state,
                    });
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                break Err(ResolutionError::Timeout {
                    job_id: job_id.to_string(),
                    waited_secs: elapsed.as_secs(),
                });
            }
            sleep(poll_interval.min(max_wait - elapsed)).await;
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(target) => {
                info!(job_id = %job_id, target = %target, polls, elapsed_secs = elapsed.as_secs_f64(), "Job resolved to node");
                telemetry::record_resolution("resolved", elapsed);
            }
            Err(ResolutionError::Timeout { .. }) => {
                warn!(job_id = %job_id, polls, "Timed out waiting for node assignment");
                telemetry::record_resolution("timeout", elapsed);
            }
            Err(e) => {
                warn!(job_id = %job_id, polls, error = %e, "Resolution aborted");
                telemetry::record_resolution("aborted", elapsed);
            }
        }
        outcome
    }
}

#[async_trait]
impl TargetResolver for NodeResolver {
    async fn resolve(&self, job_id: &str) -> Result<String, ResolutionError> {
        self.resolve_with(job_id, self.max_wait, self.poll_interval)
            .await
    }
}
