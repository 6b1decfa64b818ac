//! Contracts and interfaces for Medic components

use crate::*;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Error reported by a worker for a single task
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Logic error: {0}")]
    Logic(String),

    #[error("{0}")]
    Other(String),
}

/// Diagnosis infrastructure failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    #[error("Diagnosis oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Diagnosis oracle timed out after {0:?}")]
    Timeout(Duration),

    #[error("Diagnosis oracle returned an unusable plan: {0}")]
    InvalidPlan(String),
}

/// Rejection from an agent's reconfiguration entry point
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Patch rejected: {reason}")]
pub struct PatchRejected {
    pub reason: String,
}

impl PatchRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Task execution capability implemented by every agent variant.
///
/// Methods take `&self`: a patch may arrive while a task is running, so
/// implementations keep mutable configuration behind their own lock.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute one task
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskError>;

    /// Reconfiguration entry point, invoked only by the healing coordinator
    async fn apply_patch(&self, _payload: &serde_json::Value) -> Result<(), PatchRejected> {
        Err(PatchRejected::new("agent does not accept configuration patches"))
    }
}

/// External collaborator that maps failure context to a recovery plan
#[async_trait]
pub trait DiagnosisOracle: Send + Sync {
    async fn diagnose(&self, request: &HealingRequest) -> Result<HealingPlan, OracleError>;

    /// Name used in logs and audit payloads
    fn name(&self) -> &str {
        "oracle"
    }
}
