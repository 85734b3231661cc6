// Property-based tests for node resolution
// Poll counts and wall-clock bounds under a paused tokio clock

use aif_common::errors::{ResolutionError, SchedulerError};
use aif_common::gateway::{JobAttributes, SchedulerGateway, SubmitRequest};
use aif_common::resolver::NodeResolver;
use async_trait::async_trait;
use mockall::mock;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Gateway {}

    #[async_trait]
    impl SchedulerGateway for Gateway {
        async fn submit(&self, request: &SubmitRequest) -> Result<String, SchedulerError>;
        async fn query_status(&self, job_id: &str) -> Result<JobAttributes, SchedulerError>;
        async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError>;
        async fn list_mine(&self) -> Result<String, SchedulerError>;
    }
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

fn pending() -> JobAttributes {
    JobAttributes::from_pairs([("JobState", "PENDING"), ("NodeList", "(null)")])
}

fn running(node: &str) -> JobAttributes {
    JobAttributes::from_pairs([("JobState", "RUNNING"), ("NodeList", node)])
}

/// Gateway that reports PENDING for `pending_polls` queries and RUNNING afterwards
fn gateway_pending_then_running(pending_polls: usize, polls: Arc<AtomicUsize>) -> MockGateway {
    let mut gateway = MockGateway::new();
    gateway.expect_query_status().returning(move |_| {
        let n = polls.fetch_add(1, Ordering::SeqCst);
        if n < pending_polls {
            Ok(pending())
        } else {
            Ok(running("gpu042"))
        }
    });
    gateway
}

// Property: a job that becomes RUNNING after n pending polls resolves after
// exactly n + 1 status queries, as long as that happens within max_wait
#[test]
fn property_resolves_after_exactly_n_plus_one_polls() {
    proptest!(|(
        pending_polls in 0usize..20,
        poll_secs in 1u64..10
    )| {
        let polls = Arc::new(AtomicUsize::new(0));
        let gateway = gateway_pending_then_running(pending_polls, polls.clone());
        let max_wait = Duration::from_secs((pending_polls as u64 + 1) * poll_secs + 1);
        let resolver = NodeResolver::new(Arc::new(gateway), max_wait, Duration::from_secs(poll_secs));

        let result = paused_runtime().block_on(async { resolver.resolve_with("77", max_wait, Duration::from_secs(poll_secs)).await });

        prop_assert_eq!(result, Ok("gpu042".to_string()));
        prop_assert_eq!(polls.load(Ordering::SeqCst), pending_polls + 1);
    });
}

// Property: a job that never leaves PENDING times out after max_wait, having been
// polled ceil(max_wait / poll) + 1 times, and never waits longer than max_wait
#[test]
fn property_never_waits_past_max_wait() {
    proptest!(|(
        max_wait_secs in 1u64..120,
        poll_secs in 1u64..30
    )| {
        let polls = Arc::new(AtomicUsize::new(0));
        let gateway = gateway_pending_then_running(usize::MAX, polls.clone());
        let max_wait = Duration::from_secs(max_wait_secs);
        let poll = Duration::from_secs(poll_secs);
        let resolver = NodeResolver::new(Arc::new(gateway), max_wait, poll);

        let (result, waited) = paused_runtime().block_on(async {
            let started = tokio::time::Instant::now();
            let result = resolver.resolve_with("77", max_wait, poll).await;
            (result, started.elapsed())
        });

        let is_timeout = matches!(result, Err(ResolutionError::Timeout { .. }));
        prop_assert!(is_timeout);
        prop_assert_eq!(waited, max_wait);
        let expected_polls = max_wait_secs.div_ceil(poll_secs) as usize + 1;
        prop_assert_eq!(polls.load(Ordering::SeqCst), expected_polls);
    });
}

#[test]
fn test_ten_second_budget_with_five_second_polls_queries_at_most_three_times() {
    let polls = Arc::new(AtomicUsize::new(0));
    let gateway = gateway_pending_then_running(usize::MAX, polls.clone());
    let resolver = NodeResolver::new(Arc::new(gateway), Duration::from_secs(10), Duration::from_secs(5));

    let result = paused_runtime().block_on(async {
        resolver
            .resolve_with("77", Duration::from_secs(10), Duration::from_secs(5))
            .await
    });

    assert!(matches!(result, Err(ResolutionError::Timeout { .. })));
    assert!(polls.load(Ordering::SeqCst) <= 3);
}

#[test]
fn test_terminal_state_aborts_on_first_poll() {
    for state in ["FAILED", "CANCELLED+", "TIMEOUT", "COMPLETED"] {
        let mut gateway = MockGateway::new();
        gateway
            .expect_query_status()
            .times(1)
            .returning(move |_| Ok(JobAttributes::from_pairs([("JobState", state), ("NodeList", "(null)")])));
        let resolver = NodeResolver::new(Arc::new(gateway), Duration::from_secs(60), Duration::from_secs(5));

        let result = paused_runtime().block_on(async {
            resolver
                .resolve_with("9", Duration::from_secs(60), Duration::from_secs(5))
                .await
        });
        assert!(
            matches!(result, Err(ResolutionError::Aborted { .. })),
            "state {} should abort",
            state
        );
    }
}

#[test]
fn test_failed_query_is_not_retried() {
    let mut gateway = MockGateway::new();
    gateway.expect_query_status().times(1).returning(|job_id| {
        Err(SchedulerError::QueryFailed {
            job_id: job_id.to_string(),
            reason: "slurmctld unreachable".to_string(),
        })
    });
    let resolver = NodeResolver::new(Arc::new(gateway), Duration::from_secs(60), Duration::from_secs(5));

    let result = paused_runtime().block_on(async {
        resolver
            .resolve_with("9", Duration::from_secs(60), Duration::from_secs(5))
            .await
    });
    assert!(matches!(result, Err(ResolutionError::QueryFailed { .. })));
}

#[test]
fn test_running_with_placeholder_node_keeps_polling() {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    let mut gateway = MockGateway::new();
    gateway.expect_query_status().returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Ok(running("None assigned"))
        } else {
            Ok(running("node3"))
        }
    });
    let resolver = NodeResolver::new(Arc::new(gateway), Duration::from_secs(60), Duration::from_secs(1));

    let result = paused_runtime().block_on(async {
        resolver
            .resolve_with("9", Duration::from_secs(60), Duration::from_secs(1))
            .await
    });
    assert_eq!(result, Ok("node3".to_string()));
    assert_eq!(polls.load(Ordering::SeqCst), 3);
}
