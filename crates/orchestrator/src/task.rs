//! Submission handles and task outcomes

use medic_core::{AgentId, ErrorClass, Task, TaskOutput, Uuid};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, OwnedSemaphorePermit};

/// Final state of a submitted task as seen by the submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { output: TaskOutput },
    Failed { class: ErrorClass, message: String },
    /// Refused without running (circuit open, agent quarantined)
    Rejected { reason: String },
    /// Dropped by shutdown or deregistration
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

/// Handle returned by `Orchestrator::submit`
#[derive(Debug)]
pub struct TaskHandle {
    task_id: Uuid,
    agent_id: AgentId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Wait for the task to finish. A dispatcher that went away without
    /// answering counts as cancellation.
    pub async fn wait(self) -> TaskOutcome {
        self.rx.await.unwrap_or(TaskOutcome::Cancelled)
    }
}

/// Queue entry owned by an agent's dispatch loop. The permit keeps the slot
/// reserved until the task finishes.
#[derive(Debug)]
pub(crate) struct QueuedTask {
    pub task: Task,
    pub reply: oneshot::Sender<TaskOutcome>,
    pub _permit: OwnedSemaphorePermit,
}

impl QueuedTask {
    pub fn new(
        agent_id: AgentId,
        task: Task,
        permit: OwnedSemaphorePermit,
    ) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle {
            task_id: task.id,
            agent_id,
            rx,
        };
        (
            Self {
                task,
                reply: tx,
                _permit: permit,
            },
            handle,
        )
    }

    pub fn resolve(self, outcome: TaskOutcome) {
        // The submitter may have dropped its handle
        let _ = self.reply.send(outcome);
    }
}
