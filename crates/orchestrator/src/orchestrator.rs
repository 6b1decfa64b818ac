//! Orchestrator
//!
//! Owns the agent registry and one dispatch loop per agent. Each loop drains
//! its agent's queue sequentially, so events for one agent reach the router in
//! the order they were produced. Escalations are handed to the healing
//! coordinator on a separate task and never block the loop.
//!
//! Only boundary errors (unknown agent, full queue, quarantine, shutdown) are
//! returned to callers; execution failures surface as a `TaskOutcome`.

use crate::audit::AuditLog;
use crate::config::{ConfigError, MedicConfig};
use crate::healing::HealingCoordinator;
use crate::registry::{Agent, AgentHealth, AgentRegistry, RegistryError};
use crate::router::Router;
use crate::runtime::{AgentRuntime, ExecutionResult};
use crate::task::{QueuedTask, TaskHandle, TaskOutcome};
use medic_core::{
    AgentId, AuditKind, Decision, DiagnosisOracle, FailureEvent, HealingRequest, QuarantineReason,
    Task, Worker,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Errors surfaced synchronously by `Orchestrator::submit`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmitError {
    #[error("Unknown agent '{0}'")]
    UnknownAgent(AgentId),

    #[error("Queue for agent '{agent_id}' is full ({capacity} pending)")]
    QueueFull { agent_id: AgentId, capacity: usize },

    #[error("Agent '{agent_id}' is quarantined: {reason}")]
    Quarantined {
        agent_id: AgentId,
        reason: QuarantineReason,
    },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Task counters across all agents. Quarantines are counted by the healing
/// coordinator, which owns every quarantine transition.
#[derive(Debug, Default)]
struct OrchestratorStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    local_retries: AtomicU64,
    escalations: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub local_retries: u64,
    pub escalations: u64,
    pub quarantines: u64,
}

impl OrchestratorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed { .. } => Self::bump(&self.completed),
            TaskOutcome::Failed { .. } => Self::bump(&self.failed),
            TaskOutcome::Rejected { .. } => Self::bump(&self.rejected),
            TaskOutcome::Cancelled => Self::bump(&self.cancelled),
        }
    }

    fn snapshot(&self, quarantines: u64) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            local_retries: self.local_retries.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            quarantines,
        }
    }
}

/// Everything a dispatch loop needs, shared by all loops
#[derive(Clone)]
struct Dispatcher {
    runtime: Arc<AgentRuntime>,
    router: Arc<Router>,
    coordinator: Arc<HealingCoordinator>,
    stats: Arc<OrchestratorStats>,
    tracker: TaskTracker,
    retry_delay: Duration,
}

impl Dispatcher {
    async fn run(self, agent: Arc<Agent>, mut rx: mpsc::UnboundedReceiver<QueuedTask>) {
        let cancel = agent.cancel_token().clone();
        debug!(agent_id = %agent.id(), "Dispatch loop started");

        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            // Deregistration and shutdown abandon the running task too
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => TaskOutcome::Cancelled,
                outcome = self.execute_with_policy(&agent, &job.task) => outcome,
            };
            self.stats.record_outcome(&outcome);
            job.resolve(outcome);
        }

        rx.close();
        while let Ok(job) = rx.try_recv() {
            self.stats.record_outcome(&TaskOutcome::Cancelled);
            job.resolve(TaskOutcome::Cancelled);
        }
        debug!(agent_id = %agent.id(), "Dispatch loop stopped");
    }

    async fn execute_with_policy(&self, agent: &Agent, task: &Task) -> TaskOutcome {
        let mut last_failure: Option<FailureEvent> = None;

        loop {
            if let Some(reason) = agent.with_state(|state| state.quarantine.clone()) {
                return TaskOutcome::Rejected {
                    reason: format!("agent quarantined: {reason}"),
                };
            }

            let event = match self.runtime.execute(agent, task).await {
                ExecutionResult::Success { output, .. } => return TaskOutcome::Completed { output },
                ExecutionResult::Rejected(err) => {
                    // A local retry that hits an open breaker reports the failure it retried
                    return match last_failure {
                        Some(event) => failed(&event),
                        None => TaskOutcome::Rejected {
                            reason: err.to_string(),
                        },
                    };
                }
                ExecutionResult::Failure(event) => event,
            };

            let decision = self.router.classify(&event);
            info!(
                agent_id = %event.agent_id,
                task_id = %task.id,
                decision = %decision,
                class = %event.class(),
                consecutive_failures = event.consecutive_failures(),
                "Failure routed"
            );

            match decision {
                Decision::LocalRetry => {
                    OrchestratorStats::bump(&self.stats.local_retries);
                    last_failure = Some(event);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Decision::Escalate => {
                    OrchestratorStats::bump(&self.stats.escalations);
                    self.spawn_healing(HealingRequest::from_event(&event));
                    return failed(&event);
                }
                Decision::QuarantineImmediate { reason } => {
                    self.coordinator.quarantine(&event.agent_id, reason);
                    return failed(&event);
                }
            }
        }
    }

    fn spawn_healing(&self, request: HealingRequest) {
        let coordinator = Arc::clone(&self.coordinator);
        self.tracker.spawn(async move {
            let outcome = coordinator.heal(request).await;
            debug!(
                agent_id = %outcome.agent_id,
                status = ?outcome.status,
                coalesced = outcome.coalesced,
                "Healing finished"
            );
        });
    }
}

fn failed(event: &FailureEvent) -> TaskOutcome {
    TaskOutcome::Failed {
        class: event.class(),
        message: event.error.message.clone(),
    }
}

/// Entry point: registers agents, accepts submissions, exposes health
pub struct Orchestrator {
    config: Arc<MedicConfig>,
    registry: Arc<AgentRegistry>,
    audit: Arc<AuditLog>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: MedicConfig, oracle: Arc<dyn DiagnosisOracle>) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(AgentRegistry::new());
        let audit = Arc::new(AuditLog::new());
        let coordinator = Arc::new(HealingCoordinator::new(
            config.healing.clone(),
            oracle,
            Arc::clone(&registry),
            Arc::clone(&audit),
        ));
        let dispatcher = Dispatcher {
            runtime: Arc::new(AgentRuntime::new(&config)),
            router: Arc::new(Router::new(config.router.clone())),
            coordinator,
            stats: Arc::new(OrchestratorStats::default()),
            tracker: TaskTracker::new(),
            retry_delay: config.router.local_retry_delay(),
        };

        info!(
            failure_threshold = config.breaker.failure_threshold,
            local_retry_budget = config.router.local_retry_budget,
            quarantine_threshold = config.router.quarantine_threshold,
            queue_capacity = config.runtime.queue_capacity,
            "Orchestrator created"
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            audit,
            dispatcher,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &MedicConfig {
        &self.config
    }

    pub fn register(
        &self,
        id: impl Into<AgentId>,
        agent_type: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        let agent_type = agent_type.into();
        if self.registry.contains(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Arc::new(Agent::new(
            id.clone(),
            agent_type.clone(),
            worker,
            self.dispatcher.runtime.initial_state(),
            self.config.runtime.queue_capacity,
            tx,
            self.shutdown.child_token(),
        ));
        self.registry.insert(Arc::clone(&agent))?;

        self.audit.append(
            &id,
            AuditKind::AgentRegistered,
            json!({ "agent_type": agent_type }),
        );
        info!(agent_id = %id, agent_type = %agent_type, "Agent registered");

        self.dispatcher
            .tracker
            .spawn(self.dispatcher.clone().run(agent, rx));
        Ok(())
    }

    /// Remove an agent; its queued tasks resolve as cancelled
    pub fn deregister(&self, id: &AgentId) -> Result<(), RegistryError> {
        let agent = self.registry.remove(id)?;
        agent.cancel_token().cancel();
        self.audit
            .append(id, AuditKind::AgentDeregistered, json!({ "queued": agent.queued() }));
        info!(agent_id = %id, "Agent deregistered");
        Ok(())
    }

    pub fn submit(&self, id: &AgentId, task: Task) -> Result<TaskHandle, SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let agent = self
            .registry
            .get(id)
            .ok_or_else(|| SubmitError::UnknownAgent(id.clone()))?;

        if let Some(reason) = agent.with_state(|state| state.quarantine.clone()) {
            return Err(SubmitError::Quarantined {
                agent_id: id.clone(),
                reason,
            });
        }

        let permit = agent
            .queue()
            .try_acquire_owned()
            .map_err(|_| SubmitError::QueueFull {
                agent_id: id.clone(),
                capacity: self.config.runtime.queue_capacity,
            })?;

        let (job, handle) = QueuedTask::new(id.clone(), task, permit);
        agent
            .sender()
            .send(job)
            .map_err(|_| SubmitError::ShuttingDown)?;

        OrchestratorStats::bump(&self.dispatcher.stats.submitted);
        Ok(handle)
    }

    pub fn health(&self, id: &AgentId) -> Result<AgentHealth, RegistryError> {
        let agent = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.clone()))?;
        Ok(agent.snapshot(self.dispatcher.coordinator.is_healing(id)))
    }

    /// Health of every registered agent, sorted by id
    pub fn agents(&self) -> Vec<AgentHealth> {
        let mut agents: Vec<AgentHealth> = self
            .registry
            .all()
            .iter()
            .map(|agent| agent.snapshot(self.dispatcher.coordinator.is_healing(agent.id())))
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Manual reset of a quarantined agent. Returns whether it was quarantined.
    pub fn release_quarantine(&self, id: &AgentId) -> Result<bool, RegistryError> {
        let agent = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.clone()))?;

        match agent.release() {
            Some(reason) => {
                info!(agent_id = %id, reason = %reason, "Quarantine released");
                self.audit.append(
                    id,
                    AuditKind::QuarantineReleased,
                    json!({ "previous_reason": reason }),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn coordinator(&self) -> &HealingCoordinator {
        &self.dispatcher.coordinator
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher
            .stats
            .snapshot(self.dispatcher.coordinator.quarantines())
    }

    /// Stop all dispatch loops and wait for them and any in-flight healing.
    /// Queued tasks resolve as cancelled.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(agents = self.registry.len(), "Shutting down orchestrator");
        self.shutdown.cancel();
        self.dispatcher.tracker.close();
        self.dispatcher.tracker.wait().await;
        debug!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reports_task_counters_and_quarantines() {
        let stats = OrchestratorStats::default();
        OrchestratorStats::bump(&stats.submitted);
        OrchestratorStats::bump(&stats.submitted);
        stats.record_outcome(&TaskOutcome::Cancelled);
        stats.record_outcome(&TaskOutcome::Rejected {
            reason: "agent quarantined".into(),
        });

        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.quarantines, 2);
        assert_eq!(snapshot.completed, 0);
    }
}
