//! Agent runtime
//!
//! Wraps a single task execution: gates it through the circuit breaker, runs
//! the worker under a timeout, then records the outcome in the health record
//! and breaker as one critical section. The agent lock is never held while
//! the worker runs.
//!
//! The worker runs on its own task: a panic is reported as a logic failure
//! and takes the normal routing path instead of unwinding through the
//! dispatch loop.

use crate::config::MedicConfig;
use crate::registry::{Agent, AgentState};
use crate::reliability::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, TimeoutManager,
};
use medic_core::{
    ErrorClass, ErrorSummary, FailureEvent, HealthRecord, Task, TaskError, TaskOutput, Utc, Uuid,
    Worker,
};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

/// Result of one `AgentRuntime::execute` call
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    Success { output: TaskOutput, latency: Duration },
    Failure(FailureEvent),
    /// The breaker refused the attempt; the task did not run
    Rejected(CircuitOpenError),
}

/// Message fragments that classify an untyped error
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "unavailable",
    "rate limit",
    "temporarily",
];
const EXHAUSTION_PATTERNS: &[&str] = &["memory", "quota", "exhausted", "too many", "capacity"];
const LOGIC_PATTERNS: &[&str] = &[
    "invalid",
    "parse",
    "division by zero",
    "assert",
    "out of range",
    "missing field",
];

/// Map a worker error onto the fixed failure taxonomy
pub fn classify_error(error: &TaskError) -> ErrorClass {
    match error {
        TaskError::Io(_) | TaskError::Timeout(_) => ErrorClass::TransientIo,
        TaskError::ResourceExhausted(_) => ErrorClass::ResourceExhaustion,
        TaskError::Logic(_) => ErrorClass::Logic,
        TaskError::Other(message) => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lowered.contains(p));

    if matches(TRANSIENT_PATTERNS) {
        ErrorClass::TransientIo
    } else if matches(EXHAUSTION_PATTERNS) {
        ErrorClass::ResourceExhaustion
    } else if matches(LOGIC_PATTERNS) {
        ErrorClass::Logic
    } else {
        ErrorClass::Unknown
    }
}

#[derive(Debug)]
pub struct AgentRuntime {
    timeouts: TimeoutManager,
    breaker_config: CircuitBreakerConfig,
    history_window: usize,
    latency_window: usize,
}

impl AgentRuntime {
    pub fn new(config: &MedicConfig) -> Self {
        Self {
            timeouts: TimeoutManager::new(config.runtime.task_timeout()),
            breaker_config: config.breaker.to_breaker_config(),
            history_window: config.router.history_window,
            latency_window: config.runtime.latency_window,
        }
    }

    /// Fresh state for a newly registered agent
    pub fn initial_state(&self) -> AgentState {
        AgentState {
            health: HealthRecord::with_windows(self.history_window, self.latency_window),
            breaker: CircuitBreaker::new(self.breaker_config.clone()),
            quarantine: None,
        }
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub async fn execute(&self, agent: &Agent, task: &Task) -> ExecutionResult {
        let admission = agent.with_state(|state| match state.breaker.try_acquire() {
            Ok(admission) => Ok(admission),
            Err(err) => {
                state.health.record_rejection();
                Err(err)
            }
        });
        let admission = match admission {
            Ok(admission) => admission,
            Err(err) => {
                debug!(agent_id = %agent.id(), task_id = %task.id, error = %err, "Attempt rejected");
                return ExecutionResult::Rejected(err);
            }
        };

        let limit = task.timeout().unwrap_or(self.timeouts.default_timeout());
        let started = Instant::now();
        let result = match self
            .timeouts
            .run_with_timeout("task", limit, run_isolated(agent.worker(), task.clone()))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(limit)),
        };
        let latency = started.elapsed();

        match result {
            Ok(output) => {
                agent.with_state(|state| {
                    state.health.record_success(latency);
                    state.breaker.on_success();
                });
                debug!(
                    agent_id = %agent.id(),
                    task_id = %task.id,
                    probe = admission == Admission::Probe,
                    duration_ms = latency.as_millis() as u64,
                    "Task succeeded"
                );
                ExecutionResult::Success { output, latency }
            }
            Err(error) => {
                let class = classify_error(&error);
                let summary = ErrorSummary::new(class, error.to_string());
                let event = agent.with_state(|state| {
                    state.health.record_failure(summary.clone(), latency);
                    state.breaker.on_failure();
                    FailureEvent {
                        id: Uuid::new_v4(),
                        agent_id: agent.id().clone(),
                        agent_type: agent.agent_type().to_string(),
                        task_id: task.id,
                        error: summary,
                        health: state.health.clone(),
                        timestamp: Utc::now(),
                    }
                });
                warn!(
                    agent_id = %agent.id(),
                    task_id = %task.id,
                    class = %class,
                    consecutive_failures = event.consecutive_failures(),
                    probe = admission == Admission::Probe,
                    error = %error,
                    "Task failed"
                );
                ExecutionResult::Failure(event)
            }
        }
    }
}

/// Run one execution on a separate task. Dropping the returned future (timeout,
/// cancellation) aborts the execution.
async fn run_isolated(worker: Arc<dyn Worker>, task: Task) -> Result<TaskOutput, TaskError> {
    let handle = AbortOnDropHandle::new(tokio::spawn(async move { worker.execute(&task).await }));
    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(TaskError::Logic(format!(
            "worker panicked: {}",
            panic_message(err.into_panic())
        ))),
        Err(err) => Err(TaskError::Other(format!("Task join error: {err}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
