//! Healing coordinator
//!
//! Consults the diagnosis oracle for an escalated failure and applies the
//! returned plan to the agent. At most one healing runs per agent: a request
//! arriving while another is in flight waits for that outcome instead of
//! calling the oracle again.
//!
//! The oracle call runs under a timeout and without the agent lock, so the
//! agent keeps serving tasks (subject to its breaker) while healing is in
//! flight. Oracle failures degrade to the breaker's current backoff.

use crate::audit::AuditLog;
use crate::config::HealingConfig;
use crate::registry::{Agent, AgentRegistry};
use crate::reliability::TimeoutManager;
use common::OperationTimer;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use medic_core::{
    AgentId, AuditKind, DiagnosisOracle, HealingOutcome, HealingPlan, HealingRequest,
    HealingStatus, HealingStrategy, OracleError, QuarantineReason, Utc,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type SharedOutcome = watch::Receiver<Option<HealingOutcome>>;

/// Removes the in-flight marker when the leading healing finishes or is
/// dropped mid-way
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<AgentId, SharedOutcome>,
    agent_id: AgentId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.agent_id);
    }
}

enum Slot<'a> {
    Leader(watch::Sender<Option<HealingOutcome>>, InFlightGuard<'a>),
    Follower(SharedOutcome),
}

pub struct HealingCoordinator {
    config: HealingConfig,
    oracle: Arc<dyn DiagnosisOracle>,
    registry: Arc<AgentRegistry>,
    audit: Arc<AuditLog>,
    timeouts: TimeoutManager,
    in_flight: DashMap<AgentId, SharedOutcome>,
    oracle_calls: AtomicU64,
    quarantines: AtomicU64,
}

impl HealingCoordinator {
    pub fn new(
        config: HealingConfig,
        oracle: Arc<dyn DiagnosisOracle>,
        registry: Arc<AgentRegistry>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let timeouts = TimeoutManager::new(config.oracle_timeout());
        Self {
            config,
            oracle,
            registry,
            audit,
            timeouts,
            in_flight: DashMap::new(),
            oracle_calls: AtomicU64::new(0),
            quarantines: AtomicU64::new(0),
        }
    }

    pub fn is_healing(&self, agent_id: &AgentId) -> bool {
        self.in_flight.contains_key(agent_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Oracle invocations so far
    pub fn oracle_calls(&self) -> u64 {
        self.oracle_calls.load(Ordering::Relaxed)
    }

    /// Agents put into quarantine so far, whatever the path
    pub fn quarantines(&self) -> u64 {
        self.quarantines.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub async fn heal(&self, request: HealingRequest) -> HealingOutcome {
        let mut retries = 0u32;
        let mut waited = false;

        loop {
            match self.join_or_lead(&request.agent_id) {
                Slot::Leader(tx, guard) => {
                    let mut outcome = self.run(&request).await;
                    outcome.coalesced = waited;
                    // Clear the marker before publishing so a woken waiter that
                    // retries starts a fresh healing
                    drop(guard);
                    let _ = tx.send(Some(outcome.clone()));

                    if retries > 0 && outcome.failed() {
                        return self.exhausted(&request);
                    }
                    return outcome;
                }
                Slot::Follower(rx) => {
                    waited = true;
                    debug!(agent_id = %request.agent_id, request_id = %request.id, "Healing already in flight, waiting");
                    self.audit.append(
                        &request.agent_id,
                        AuditKind::HealingCoalesced,
                        json!({
                            "request_id": request.id,
                            "origin_event": request.origin_event,
                        }),
                    );

                    let shared = wait_shared(rx).await;
                    match shared {
                        Some(outcome) if !outcome.failed() => {
                            return HealingOutcome {
                                request_id: request.id,
                                coalesced: true,
                                ..outcome
                            };
                        }
                        _ if retries < self.config.coalesced_retry_limit => {
                            retries += 1;
                            info!(agent_id = %request.agent_id, "Shared healing failed, retrying coalesced request");
                        }
                        _ => return self.exhausted(&request),
                    }
                }
            }
        }
    }

    /// Quarantine an agent and audit it. Returns false when the agent is
    /// unknown or already quarantined.
    pub fn quarantine(&self, agent_id: &AgentId, reason: QuarantineReason) -> bool {
        let Some(agent) = self.registry.get(agent_id) else {
            return false;
        };
        if !agent.quarantine(reason.clone()) {
            return false;
        }
        self.quarantines.fetch_add(1, Ordering::Relaxed);
        warn!(agent_id = %agent_id, reason = %reason, "Agent quarantined");
        self.audit.append(
            agent_id,
            AuditKind::Quarantined,
            json!({ "reason": reason, "message": reason.to_string() }),
        );
        true
    }

    fn join_or_lead(&self, agent_id: &AgentId) -> Slot<'_> {
        match self.in_flight.entry(agent_id.clone()) {
            Entry::Occupied(e) => Slot::Follower(e.get().clone()),
            Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(None);
                e.insert(rx);
                Slot::Leader(
                    tx,
                    InFlightGuard {
                        in_flight: &self.in_flight,
                        agent_id: agent_id.clone(),
                    },
                )
            }
        }
    }

    async fn run(&self, request: &HealingRequest) -> HealingOutcome {
        let Some(agent) = self.registry.get(&request.agent_id) else {
            return self.finish(
                request,
                HealingStatus::Failed {
                    reason: "agent is no longer registered".into(),
                },
                None,
                None,
                None,
            );
        };

        if let Some(reason) = agent.with_state(|state| state.quarantine.clone()) {
            debug!(agent_id = %request.agent_id, "Agent already quarantined, skipping diagnosis");
            return self.finish(
                request,
                HealingStatus::Quarantined { reason },
                None,
                None,
                None,
            );
        }

        let (diagnosis, latency) = self.diagnose(request).await;

        // The router may have quarantined the agent while diagnosis ran
        if let (Ok(plan), Some(reason)) = (
            &diagnosis,
            agent.with_state(|state| state.quarantine.clone()),
        ) {
            debug!(agent_id = %request.agent_id, strategy = %plan.strategy, "Agent quarantined during diagnosis, plan not applied");
            return self.finish(
                request,
                HealingStatus::Quarantined { reason },
                Some(plan.strategy.clone()),
                Some(plan),
                Some(latency),
            );
        }

        match diagnosis {
            Ok(plan) => {
                let status = self.apply(&agent, &plan).await;
                info!(
                    agent_id = %request.agent_id,
                    strategy = %plan.strategy,
                    confidence = plan.confidence,
                    "Healing plan applied"
                );
                self.finish(request, status, Some(plan.strategy.clone()), Some(&plan), Some(latency))
            }
            Err(err) => {
                // The breaker keeps its current open duration
                warn!(
                    agent_id = %request.agent_id,
                    error = %err,
                    "Diagnosis failed, falling back to backoff"
                );
                self.finish(
                    request,
                    HealingStatus::Fallback {
                        reason: err.to_string(),
                    },
                    Some(HealingStrategy::RetryWithBackoff { backoff_ms: None }),
                    None,
                    Some(latency),
                )
            }
        }
    }

    async fn diagnose(&self, request: &HealingRequest) -> (Result<HealingPlan, OracleError>, Duration) {
        let mut timer = OperationTimer::new("diagnose");
        timer.add_field("agent_id", request.agent_id.as_str());
        timer.add_field("oracle", self.oracle.name());

        self.oracle_calls.fetch_add(1, Ordering::Relaxed);
        let limit = self.config.oracle_timeout();
        let result = match self
            .timeouts
            .run_with_timeout("diagnose", limit, self.oracle.diagnose(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(limit)),
        };

        let min = self.config.min_plan_confidence;
        let result = result.and_then(|plan| {
            if plan.is_valid(min) {
                Ok(plan)
            } else {
                Err(OracleError::InvalidPlan(format!(
                    "confidence {} outside [{}, 1.0]",
                    plan.confidence, min
                )))
            }
        });

        let latency = timer.finish_with_result(&result);
        (result, latency)
    }

    async fn apply(&self, agent: &Agent, plan: &HealingPlan) -> HealingStatus {
        match &plan.strategy {
            HealingStrategy::RetryWithBackoff { backoff_ms } => {
                let backoff = backoff_ms.map(Duration::from_millis);
                agent.with_state(|state| state.breaker.force_half_open(backoff));
                HealingStatus::Applied
            }
            HealingStrategy::ResetState => {
                agent.with_state(|state| {
                    state.health.reset_failures();
                    state.breaker.force_close();
                });
                HealingStatus::Applied
            }
            HealingStrategy::ApplyPatch { payload } => {
                match agent.worker().apply_patch(payload).await {
                    Ok(()) => {
                        agent.with_state(|state| state.breaker.force_close());
                        HealingStatus::Applied
                    }
                    Err(rejected) => {
                        warn!(agent_id = %agent.id(), error = %rejected, "Patch rejected by agent");
                        HealingStatus::Failed {
                            reason: rejected.to_string(),
                        }
                    }
                }
            }
            HealingStrategy::Quarantine => {
                self.quarantine(agent.id(), QuarantineReason::Prescribed);
                HealingStatus::Quarantined {
                    reason: QuarantineReason::Prescribed,
                }
            }
        }
    }

    fn exhausted(&self, request: &HealingRequest) -> HealingOutcome {
        let reason = QuarantineReason::HealingExhausted;
        self.quarantine(&request.agent_id, reason.clone());
        HealingOutcome {
            request_id: request.id,
            agent_id: request.agent_id.clone(),
            status: HealingStatus::Quarantined { reason },
            strategy: Some(HealingStrategy::Quarantine),
            oracle_latency_ms: None,
            coalesced: true,
            completed_at: Utc::now(),
        }
    }

    fn finish(
        &self,
        request: &HealingRequest,
        status: HealingStatus,
        strategy: Option<HealingStrategy>,
        plan: Option<&HealingPlan>,
        latency: Option<Duration>,
    ) -> HealingOutcome {
        let outcome = HealingOutcome {
            request_id: request.id,
            agent_id: request.agent_id.clone(),
            status,
            strategy,
            oracle_latency_ms: latency.map(|d| d.as_millis() as u64),
            coalesced: false,
            completed_at: Utc::now(),
        };

        self.audit.append(
            &request.agent_id,
            AuditKind::HealingAttempt,
            json!({
                "request": request,
                "oracle": self.oracle.name(),
                "plan": plan,
                "status": outcome.status,
                "oracle_latency_ms": outcome.oracle_latency_ms,
            }),
        );
        outcome
    }
}

async fn wait_shared(mut rx: SharedOutcome) -> Option<HealingOutcome> {
    // Err means the leading healing was dropped before it published
    rx.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|outcome| (*outcome).clone())
}
