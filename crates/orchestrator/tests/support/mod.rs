//! Shared fixtures for orchestrator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use medic_core::{
    AgentId, DiagnosisOracle, HealingPlan, HealingRequest, OracleError, PatchRejected, Task,
    TaskError, TaskOutput, Worker,
};
use orchestrator::MedicConfig;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Worker that replays a fixed script of results, then falls back to a
/// default result for every later task
pub struct ScriptedWorker {
    script: Mutex<VecDeque<Result<TaskOutput, TaskError>>>,
    fallback: Option<TaskError>,
    executed: Mutex<Vec<String>>,
    patches: Mutex<Vec<Value>>,
    accept_patches: bool,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedWorker {
    pub fn succeeding() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            executed: Mutex::new(Vec::new()),
            patches: Mutex::new(Vec::new()),
            accept_patches: true,
            gate: None,
        }
    }

    /// Fail with `errors` in order, then succeed
    pub fn failing_first(errors: Vec<TaskError>) -> Self {
        let worker = Self::succeeding();
        *worker.script.lock() = errors.into_iter().map(Err).collect();
        worker
    }

    /// Replay `results` in order, then succeed
    pub fn scripted(results: Vec<Result<TaskOutput, TaskError>>) -> Self {
        let worker = Self::succeeding();
        *worker.script.lock() = results.into();
        worker
    }

    pub fn always_failing(error: TaskError) -> Self {
        Self {
            fallback: Some(error),
            ..Self::succeeding()
        }
    }

    pub fn rejecting_patches(mut self) -> Self {
        self.accept_patches = false;
        self
    }

    /// Every execution waits for one permit from `gate`
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Task kinds in the order they started
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn patches(&self) -> Vec<Value> {
        self.patches.lock().clone()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskError> {
        self.executed.lock().push(task.kind.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| TaskError::Other(e.to_string()))?
                .forget();
        }

        let scripted = self.script.lock().pop_front();
        match (scripted, &self.fallback) {
            (Some(result), _) => result,
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Ok(json!({ "kind": task.kind })),
        }
    }

    async fn apply_patch(&self, payload: &Value) -> Result<(), PatchRejected> {
        self.patches.lock().push(payload.clone());
        if self.accept_patches {
            Ok(())
        } else {
            Err(PatchRejected::new("patch payload not understood"))
        }
    }
}

/// Worker that panics on its first `panics` executions, then succeeds
pub struct PanickingWorker {
    panics: AtomicUsize,
    executed: AtomicUsize,
}

impl PanickingWorker {
    pub fn new(panics: usize) -> Self {
        Self {
            panics: AtomicUsize::new(panics),
            executed: AtomicUsize::new(0),
        }
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for PanickingWorker {
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let remaining = self.panics.load(Ordering::SeqCst);
        if remaining > 0 {
            self.panics.store(remaining - 1, Ordering::SeqCst);
            panic!("unexpected null in {}", task.kind);
        }
        Ok(json!({ "kind": task.kind }))
    }
}

/// Oracle that holds every diagnosis until the test releases a permit and
/// tracks how many diagnoses overlap
pub struct GatedOracle {
    plan: HealingPlan,
    gate: Arc<Semaphore>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl GatedOracle {
    pub fn new(plan: HealingPlan) -> Self {
        Self {
            plan,
            gate: Arc::new(Semaphore::new(0)),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosisOracle for GatedOracle {
    async fn diagnose(&self, _request: &HealingRequest) -> Result<HealingPlan, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let permit = self.gate.acquire().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        permit
            .map_err(|e| OracleError::Unavailable(e.to_string()))?
            .forget();
        Ok(self.plan.clone())
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Oracle that is unreachable until switched to hanging mode, where it
/// never answers within any reasonable timeout
#[derive(Default)]
pub struct FlakyOracle {
    hanging: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyOracle {
    pub fn hang(&self) {
        self.hanging.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosisOracle for FlakyOracle {
    async fn diagnose(&self, _request: &HealingRequest) -> Result<HealingPlan, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Err(OracleError::Unavailable("connection refused".into()))
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Small, fast configuration for tests
pub fn test_config() -> MedicConfig {
    let mut config = MedicConfig::default();
    config.breaker.failure_threshold = 3;
    config.breaker.base_open_ms = 1_000;
    config.breaker.max_open_ms = 8_000;
    config.router.local_retry_delay_ms = 10;
    config.healing.oracle_timeout_ms = 5_000;
    config
}

pub fn task(kind: &str) -> Task {
    Task::new(kind, json!({ "kind": kind }))
}

pub fn agent(id: &str) -> AgentId {
    AgentId::from(id)
}

pub fn healing_request(agent_id: &str) -> HealingRequest {
    HealingRequest {
        id: medic_core::Uuid::new_v4(),
        agent_id: agent(agent_id),
        agent_type: "test".to_string(),
        origin_event: medic_core::Uuid::new_v4(),
        error_class: medic_core::ErrorClass::TransientIo,
        error_message: "connection reset".to_string(),
        signature: "connection reset".to_string(),
        consecutive_failures: 3,
        total_failures: 3,
        recent_errors: Vec::new(),
        created_at: medic_core::Utc::now(),
    }
}

/// Yield to spawned tasks until `condition` holds. Does not advance time.
pub async fn settle(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..10_000 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}
