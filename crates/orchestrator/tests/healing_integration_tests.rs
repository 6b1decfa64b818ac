//! Healing path integration tests
//!
//! Covers:
//! - Coalescing of concurrent healing requests for one agent
//! - Oracle timeout and unavailability falling back to the breaker backoff
//! - RESET_STATE, APPLY_PATCH and QUARANTINE plans
//! - Retry and quarantine when a coalesced healing fails
//! - Quarantine without diagnosis for non-recoverable failures
//! - Identical logic errors separated by a success staying recoverable
//! - Plans discarded when the agent is quarantined during diagnosis

mod support;

use anyhow::Result;
use medic_core::{AuditKind, HealingPlan, HealingStatus, QuarantineReason, TaskError};
use orchestrator::{
    CircuitBreakerState, Orchestrator, RuleTableOracle, SubmitError, TaskOutcome,
};
use rstest::rstest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::*;

/// Concurrent requests for one agent produce a single oracle call and share its outcome
#[tokio::test]
async fn test_concurrent_requests_share_one_healing() -> Result<()> {
    let oracle = Arc::new(GatedOracle::new(
        HealingPlan::reset_state().with_confidence(0.9),
    ));
    let orchestrator = Arc::new(Orchestrator::new(test_config(), oracle.clone())?);
    orchestrator.register("gateway", "api_gateway", Arc::new(ScriptedWorker::succeeding()))?;

    let mut joins = Vec::new();
    for _ in 0..5 {
        let orchestrator = Arc::clone(&orchestrator);
        joins.push(tokio::spawn(async move {
            orchestrator.coordinator().heal(healing_request("gateway")).await
        }));
    }

    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingCoalesced) == 4).await);
    assert_eq!(oracle.active(), 1);
    assert!(orchestrator.coordinator().is_healing(&agent("gateway")));
    assert!(orchestrator.health(&agent("gateway"))?.healing_in_flight);

    oracle.release(1);
    let mut outcomes = Vec::new();
    for join in joins {
        outcomes.push(join.await?);
    }

    assert_eq!(oracle.calls(), 1);
    assert_eq!(oracle.max_active(), 1);
    assert!(outcomes.iter().all(|o| o.status == HealingStatus::Applied));
    assert_eq!(outcomes.iter().filter(|o| o.coalesced).count(), 4);
    assert_eq!(orchestrator.audit().count(AuditKind::HealingAttempt), 1);
    assert!(!orchestrator.coordinator().is_healing(&agent("gateway")));

    let mut request_ids: Vec<_> = outcomes.iter().map(|o| o.request_id).collect();
    request_ids.sort();
    request_ids.dedup();
    assert_eq!(request_ids.len(), 5, "each caller keeps its own request id");

    orchestrator.shutdown().await;
    Ok(())
}

/// An oracle timeout falls back without touching the doubled open duration
#[tokio::test(start_paused = true)]
async fn test_oracle_timeout_keeps_current_backoff() -> Result<()> {
    let oracle = Arc::new(FlakyOracle::default());
    let orchestrator = Orchestrator::new(test_config(), oracle.clone())?;
    orchestrator.register(
        "gateway",
        "api_gateway",
        Arc::new(ScriptedWorker::always_failing(TaskError::Io(
            "connection reset by peer".into(),
        ))),
    )?;
    let id = agent("gateway");

    // Three failures open the breaker at the base interval
    let outcome = orchestrator.submit(&id, task("request-1"))?.wait().await;
    assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 1).await);
    let breaker = orchestrator.health(&id)?.breaker;
    assert_eq!(breaker.state, CircuitBreakerState::Open);
    assert_eq!(breaker.current_open_duration, Duration::from_millis(1_000));

    // The failed probe doubles it
    tokio::time::advance(Duration::from_millis(1_000)).await;
    let outcome = orchestrator.submit(&id, task("request-2"))?.wait().await;
    assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 2).await);
    assert_eq!(
        orchestrator.health(&id)?.breaker.current_open_duration,
        Duration::from_millis(2_000)
    );

    oracle.hang();
    let outcome = orchestrator.coordinator().heal(healing_request("gateway")).await;

    match &outcome.status {
        HealingStatus::Fallback { reason } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected fallback, got {other:?}"),
    }
    let breaker = orchestrator.health(&id)?.breaker;
    assert_eq!(breaker.state, CircuitBreakerState::Open);
    assert_eq!(breaker.current_open_duration, Duration::from_millis(2_000));
    assert_eq!(
        orchestrator.coordinator().timeouts().stats().timed_out_operations,
        1
    );

    orchestrator.shutdown().await;
    Ok(())
}

/// A plan below the confidence floor is treated like an oracle failure
#[tokio::test]
async fn test_low_confidence_plan_falls_back() -> Result<()> {
    let oracle = Arc::new(RuleTableOracle::always(
        HealingPlan::quarantine().with_confidence(0.2),
    ));
    let orchestrator = Orchestrator::new(test_config(), oracle.clone())?;
    orchestrator.register("analytics", "analytics", Arc::new(ScriptedWorker::succeeding()))?;

    let outcome = orchestrator.coordinator().heal(healing_request("analytics")).await;

    assert!(
        matches!(&outcome.status, HealingStatus::Fallback { reason } if reason.contains("confidence"))
    );
    assert_eq!(oracle.calls(), 1);
    assert!(orchestrator.health(&agent("analytics"))?.quarantine.is_none());

    orchestrator.shutdown().await;
    Ok(())
}

/// RESET_STATE leaves zero consecutive failures and a closed breaker
#[rstest]
#[case::transient(TaskError::Io("connection reset".into()), 3)]
#[case::exhaustion(TaskError::ResourceExhausted("connection pool drained".into()), 1)]
#[case::unclassified(TaskError::Other("unexpected response shape".into()), 1)]
#[tokio::test]
async fn test_reset_state_clears_failures_and_closes_breaker(
    #[case] error: TaskError,
    #[case] attempts: usize,
) -> Result<()> {
    let oracle = Arc::new(RuleTableOracle::always(
        HealingPlan::reset_state().with_confidence(0.9),
    ));
    let orchestrator = Orchestrator::new(test_config(), oracle.clone())?;
    let worker = Arc::new(ScriptedWorker::failing_first(vec![error; attempts]));
    orchestrator.register("processor", "data_processor", worker.clone())?;
    let id = agent("processor");

    let outcome = orchestrator.submit(&id, task("batch-1"))?.wait().await;
    assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    assert_eq!(worker.executed().len(), attempts);

    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 1).await);
    let health = orchestrator.health(&id)?;
    assert_eq!(health.health.consecutive_failures, 0);
    assert_eq!(health.breaker.state, CircuitBreakerState::Closed);
    assert_eq!(oracle.calls(), 1);

    let outcome = orchestrator.submit(&id, task("batch-2"))?.wait().await;
    assert!(outcome.is_completed());

    orchestrator.shutdown().await;
    Ok(())
}

/// Two local retries, then escalation; the prescribed patch reaches the agent once
#[tokio::test]
async fn test_escalation_applies_patch_and_closes_breaker() -> Result<()> {
    let payload = json!({ "rate_limit_per_second": 50 });
    let oracle = Arc::new(RuleTableOracle::always(
        HealingPlan::apply_patch(payload.clone()).with_confidence(0.85),
    ));
    let orchestrator = Orchestrator::new(test_config(), oracle.clone())?;
    let worker = Arc::new(ScriptedWorker::failing_first(vec![
        TaskError::Io(
            "API Gateway timeout: Backend service unavailable".into()
        );
        3
    ]));
    orchestrator.register("gateway", "api_gateway", worker.clone())?;
    let id = agent("gateway");

    let outcome = orchestrator.submit(&id, task("route"))?.wait().await;
    assert!(matches!(
        outcome,
        TaskOutcome::Failed {
            class: medic_core::ErrorClass::TransientIo,
            ..
        }
    ));

    let stats = orchestrator.stats();
    assert_eq!(stats.local_retries, 2);
    assert_eq!(stats.escalations, 1);

    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 1).await);
    assert_eq!(worker.patches(), vec![payload]);

    let health = orchestrator.health(&id)?;
    assert_eq!(health.breaker.state, CircuitBreakerState::Closed);
    // A patch changes configuration, not the failure history
    assert_eq!(health.health.consecutive_failures, 3);

    let attempts = orchestrator.audit().records_for(&id);
    let attempt = attempts
        .iter()
        .find(|r| r.kind == AuditKind::HealingAttempt)
        .expect("healing attempt audited");
    assert_eq!(attempt.payload["status"]["status"], "applied");
    assert_eq!(attempt.payload["plan"]["strategy"], "APPLY_PATCH");

    let outcome = orchestrator.submit(&id, task("route"))?.wait().await;
    assert!(outcome.is_completed());
    assert_eq!(orchestrator.health(&id)?.health.consecutive_failures, 0);

    orchestrator.shutdown().await;
    Ok(())
}

/// A prescribed quarantine removes the agent from service
#[tokio::test]
async fn test_prescribed_quarantine() -> Result<()> {
    let oracle = Arc::new(RuleTableOracle::always(
        HealingPlan::quarantine().with_confidence(0.95),
    ));
    let orchestrator = Orchestrator::new(test_config(), oracle)?;
    orchestrator.register(
        "analytics",
        "analytics",
        Arc::new(ScriptedWorker::always_failing(TaskError::ResourceExhausted(
            "heap quota exceeded".into(),
        ))),
    )?;
    let id = agent("analytics");

    let outcome = orchestrator.submit(&id, task("report"))?.wait().await;
    assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    assert!(settle(|| orchestrator.audit().count(AuditKind::Quarantined) == 1).await);

    assert_eq!(
        orchestrator.submit(&id, task("report")).err(),
        Some(SubmitError::Quarantined {
            agent_id: id.clone(),
            reason: QuarantineReason::Prescribed,
        })
    );
    assert_eq!(orchestrator.stats().quarantines, 1);

    orchestrator.shutdown().await;
    Ok(())
}

/// A waiter whose shared healing failed retries once, then quarantines the agent
#[tokio::test]
async fn test_failed_coalesced_healing_retries_then_quarantines() -> Result<()> {
    let oracle = Arc::new(GatedOracle::new(
        HealingPlan::apply_patch(json!({ "batch_size": 16 })).with_confidence(0.9),
    ));
    let orchestrator = Arc::new(Orchestrator::new(test_config(), oracle.clone())?);
    let worker = Arc::new(ScriptedWorker::succeeding().rejecting_patches());
    orchestrator.register("processor", "data_processor", worker.clone())?;

    let leader = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator.coordinator().heal(healing_request("processor")).await
        })
    };
    assert!(settle(|| oracle.active() == 1).await);
    let follower = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator.coordinator().heal(healing_request("processor")).await
        })
    };
    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingCoalesced) == 1).await);

    oracle.release(2);
    let leader = leader.await?;
    let follower = follower.await?;

    assert!(leader.failed());
    assert_eq!(
        follower.status,
        HealingStatus::Quarantined {
            reason: QuarantineReason::HealingExhausted
        }
    );
    assert_eq!(oracle.calls(), 2);
    assert_eq!(worker.patches().len(), 2);
    assert_eq!(
        orchestrator.health(&agent("processor"))?.quarantine,
        Some(QuarantineReason::HealingExhausted)
    );

    orchestrator.shutdown().await;
    Ok(())
}

/// A repeated logic error quarantines the agent without a second diagnosis
#[tokio::test]
async fn test_repeated_logic_error_quarantines_without_diagnosis() -> Result<()> {
    let oracle = Arc::new(RuleTableOracle::default());
    let orchestrator = Orchestrator::new(test_config(), oracle.clone())?;
    orchestrator.register(
        "processor",
        "data_processor",
        Arc::new(ScriptedWorker::always_failing(TaskError::Logic(
            "division by zero in aggregate 42".into(),
        ))),
    )?;
    let id = agent("processor");

    // First occurrence escalates and the default table resets the agent
    orchestrator.submit(&id, task("aggregate"))?.wait().await;
    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 1).await);
    assert_eq!(orchestrator.health(&id)?.health.consecutive_failures, 0);

    // The same signature again is non-recoverable
    orchestrator.submit(&id, task("aggregate"))?.wait().await;
    assert!(settle(|| orchestrator.audit().count(AuditKind::Quarantined) == 1).await);

    assert_eq!(oracle.calls(), 1);
    assert_eq!(orchestrator.stats().escalations, 1);
    assert!(matches!(
        orchestrator.health(&id)?.quarantine,
        Some(QuarantineReason::NonRecoverable { .. })
    ));
    assert!(matches!(
        orchestrator.submit(&id, task("aggregate")),
        Err(SubmitError::Quarantined { .. })
    ));

    orchestrator.shutdown().await;
    Ok(())
}

/// A success between two identical logic errors starts a new episode
#[tokio::test]
async fn test_logic_error_after_recovery_escalates_again() -> Result<()> {
    let oracle = Arc::new(RuleTableOracle::default());
    let orchestrator = Orchestrator::new(test_config(), oracle.clone())?;
    orchestrator.register(
        "processor",
        "data_processor",
        Arc::new(ScriptedWorker::scripted(vec![
            Err(TaskError::Logic("invalid record 7".into())),
            Ok(json!({ "ok": true })),
            Ok(json!({ "ok": true })),
            Err(TaskError::Logic("invalid record 9".into())),
        ])),
    )?;
    let id = agent("processor");

    orchestrator.submit(&id, task("validate"))?.wait().await;
    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 1).await);

    for _ in 0..2 {
        assert!(orchestrator.submit(&id, task("validate"))?.wait().await.is_completed());
    }
    assert!(orchestrator.health(&id)?.health.recent_errors.is_empty());

    let outcome = orchestrator.submit(&id, task("validate"))?.wait().await;
    assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 2).await);

    assert_eq!(oracle.calls(), 2);
    assert_eq!(orchestrator.stats().escalations, 2);
    assert_eq!(orchestrator.health(&id)?.quarantine, None);
    assert_eq!(orchestrator.audit().count(AuditKind::Quarantined), 0);

    orchestrator.shutdown().await;
    Ok(())
}

/// A plan arriving after the agent was quarantined is not applied
#[tokio::test]
async fn test_quarantine_during_diagnosis_discards_plan() -> Result<()> {
    let oracle = Arc::new(GatedOracle::new(HealingPlan::reset_state().with_confidence(0.9)));
    let orchestrator = Orchestrator::new(test_config(), oracle.clone())?;
    orchestrator.register(
        "gateway",
        "api_gateway",
        Arc::new(ScriptedWorker::always_failing(TaskError::Io(
            "connection refused".into(),
        ))),
    )?;
    let id = agent("gateway");

    // Two local retries, then the third failure opens the breaker and escalates
    let outcome = orchestrator.submit(&id, task("route"))?.wait().await;
    assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    assert!(settle(|| oracle.active() == 1).await);

    assert!(orchestrator
        .coordinator()
        .quarantine(&id, QuarantineReason::Prescribed));
    oracle.release(1);
    assert!(settle(|| orchestrator.audit().count(AuditKind::HealingAttempt) == 1).await);

    let health = orchestrator.health(&id)?;
    assert_eq!(health.quarantine, Some(QuarantineReason::Prescribed));
    assert_eq!(health.breaker.state, CircuitBreakerState::Open);
    assert_eq!(health.health.consecutive_failures, 3);

    let attempt = orchestrator
        .audit()
        .records()
        .into_iter()
        .find(|r| r.kind == AuditKind::HealingAttempt)
        .expect("healing attempt audited");
    assert_eq!(attempt.payload["status"]["status"], "quarantined");
    assert_eq!(attempt.payload["plan"]["strategy"], "RESET_STATE");

    orchestrator.shutdown().await;
    Ok(())
}

/// Reaching the consecutive failure threshold quarantines instead of escalating
#[tokio::test]
async fn test_failure_threshold_quarantines_without_escalation() -> Result<()> {
    let mut config = test_config();
    config.breaker.failure_threshold = 100;
    config.router.quarantine_threshold = 10;
    let oracle = Arc::new(FlakyOracle::default());
    let orchestrator = Orchestrator::new(config, oracle.clone())?;
    orchestrator.register(
        "analytics",
        "analytics",
        Arc::new(ScriptedWorker::always_failing(TaskError::Other(
            "unexpected response shape".into(),
        ))),
    )?;
    let id = agent("analytics");

    for i in 0..10 {
        let outcome = orchestrator.submit(&id, task(&format!("job-{i}")))?.wait().await;
        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    }
    let healings = || {
        orchestrator.audit().count(AuditKind::HealingAttempt)
            + orchestrator.audit().count(AuditKind::HealingCoalesced)
    };
    assert!(settle(|| healings() == 9).await);
    assert_eq!(orchestrator.coordinator().in_flight_count(), 0);

    assert_eq!(orchestrator.stats().escalations, 9);
    assert_eq!(
        orchestrator.health(&id)?.quarantine,
        Some(QuarantineReason::FailureThreshold {
            consecutive_failures: 10
        })
    );
    assert!(oracle.calls() <= 9);

    orchestrator.shutdown().await;
    Ok(())
}
