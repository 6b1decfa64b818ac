//! Agent registry
//!
//! Read-mostly map of registered agents. Each agent owns its health record and
//! circuit breaker behind a single lock so the two always change together.

use crate::reliability::{CircuitBreaker, CircuitBreakerStats};
use crate::task::QueuedTask;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use medic_core::{AgentId, HealthRecord, QuarantineReason, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Agent '{0}' is already registered")]
    AlreadyRegistered(AgentId),

    #[error("Unknown agent '{0}'")]
    UnknownAgent(AgentId),
}

/// Mutable per-agent state guarded by the agent lock
#[derive(Debug)]
pub struct AgentState {
    pub health: HealthRecord,
    pub breaker: CircuitBreaker,
    pub quarantine: Option<QuarantineReason>,
}

/// Point-in-time view returned by the health query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub health: HealthRecord,
    pub breaker: CircuitBreakerStats,
    pub quarantine: Option<QuarantineReason>,
    /// Pending tasks, the running one included
    pub queued: usize,
    pub healing_in_flight: bool,
    pub registered_at: DateTime<Utc>,
}

/// A registered agent
pub struct Agent {
    id: AgentId,
    agent_type: String,
    worker: Arc<dyn Worker>,
    state: Mutex<AgentState>,
    queue: Arc<Semaphore>,
    queue_capacity: usize,
    sender: mpsc::UnboundedSender<QueuedTask>,
    cancel: CancellationToken,
    registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub(crate) fn new(
        id: AgentId,
        agent_type: String,
        worker: Arc<dyn Worker>,
        state: AgentState,
        queue_capacity: usize,
        sender: mpsc::UnboundedSender<QueuedTask>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            agent_type,
            worker,
            state: Mutex::new(state),
            queue: Arc::new(Semaphore::new(queue_capacity)),
            queue_capacity,
            sender,
            cancel,
            registered_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn worker(&self) -> Arc<dyn Worker> {
        Arc::clone(&self.worker)
    }

    /// Run `f` inside the agent's critical section. Never call across an await.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut AgentState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn is_quarantined(&self) -> bool {
        self.state.lock().quarantine.is_some()
    }

    /// Mark unavailable for new work. Returns false if already quarantined.
    pub fn quarantine(&self, reason: QuarantineReason) -> bool {
        let mut state = self.state.lock();
        if state.quarantine.is_some() {
            return false;
        }
        state.quarantine = Some(reason);
        true
    }

    /// Manual reset: clears quarantine, failure streak and breaker.
    /// Returns the reason the agent was quarantined for, if it was.
    pub fn release(&self) -> Option<QuarantineReason> {
        let mut state = self.state.lock();
        let reason = state.quarantine.take();
        state.health.reset_failures();
        state.health.clear_history();
        state.breaker.reset();
        reason
    }

    pub(crate) fn queue(&self) -> Arc<Semaphore> {
        Arc::clone(&self.queue)
    }

    pub(crate) fn sender(&self) -> &mpsc::UnboundedSender<QueuedTask> {
        &self.sender
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn queued(&self) -> usize {
        self.queue_capacity
            .saturating_sub(self.queue.available_permits())
    }

    pub fn snapshot(&self, healing_in_flight: bool) -> AgentHealth {
        let state = self.state.lock();
        AgentHealth {
            agent_id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            health: state.health.clone(),
            breaker: state.breaker.stats(),
            quarantine: state.quarantine.clone(),
            queued: self.queued(),
            healing_in_flight,
            registered_at: self.registered_at,
        }
    }
}

/// Concurrent map of agents keyed by id
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent: Arc<Agent>) -> Result<(), RegistryError> {
        use dashmap::mapref::entry::Entry;

        match self.agents.entry(agent.id().clone()) {
            Entry::Occupied(e) => Err(RegistryError::AlreadyRegistered(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(agent);
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: &AgentId) -> Result<Arc<Agent>, RegistryError> {
        self.agents
            .remove(id)
            .map(|(_, agent)| agent)
            .ok_or_else(|| RegistryError::UnknownAgent(id.clone()))
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered ids in sorted order
    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<Agent>> {
        self.agents.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
