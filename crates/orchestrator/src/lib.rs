//! Self-healing orchestration for autonomous worker agents
//!
//! Every task attempt runs through the agent's circuit breaker and updates its
//! health record. Failures are routed to one of three paths:
//!
//! - **Local retry**: transient failures within the retry budget
//! - **Escalation**: the healing coordinator asks a diagnosis oracle for a
//!   plan and applies it, at most one healing per agent at a time
//! - **Quarantine**: repeated identical logic errors or too many consecutive
//!   failures remove the agent from service until released
//!
//! # Usage
//!
//! ```no_run
//! use orchestrator::{MedicConfig, Orchestrator, RuleTableOracle};
//! use medic_core::{AgentId, Task, TaskError, TaskOutput, Worker};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Worker for Echo {
//!     async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskError> {
//!         Ok(task.payload.clone())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator =
//!         Orchestrator::new(MedicConfig::default(), Arc::new(RuleTableOracle::default()))?;
//!     orchestrator.register("echo", "echo", Arc::new(Echo))?;
//!
//!     let handle = orchestrator.submit(&AgentId::from("echo"), Task::new("ping", serde_json::json!({})))?;
//!     println!("{:?}", handle.wait().await);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod healing;
pub mod oracle;
pub mod orchestrator;
pub mod registry;
pub mod reliability;
pub mod router;
pub mod runtime;
pub mod task;

pub use audit::AuditLog;
pub use config::{
    BreakerSettings, ConfigError, ConfigLoader, HealingConfig, MedicConfig, RouterConfig,
    RuntimeConfig,
};
pub use healing::HealingCoordinator;
pub use oracle::{HttpOracle, OracleRule, RuleTableOracle};
pub use orchestrator::{Orchestrator, StatsSnapshot, SubmitError};
pub use registry::{AgentHealth, AgentRegistry, RegistryError};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStats,
    CircuitOpenError, OperationTimeoutError, TimeoutManager,
};
pub use router::Router;
pub use runtime::{classify_error, AgentRuntime, ExecutionResult};
pub use task::{TaskHandle, TaskOutcome};

/// Crate-level error for callers that want a single type
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Submission rejected: {0}")]
    Submit(#[from] SubmitError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
