//! Core domain models and contracts for Medic
//!
//! This crate contains the domain layer shared by the orchestrator and its
//! collaborators:
//! - Task, HealthRecord, FailureEvent, HealingRequest, HealingPlan, Decision
//! - Audit records emitted by the healing path
//! - Contracts: Worker, DiagnosisOracle

pub mod audit;
pub mod contracts;
pub mod domain;

pub use audit::*;
pub use contracts::*;
pub use domain::*;

/// Re-export common types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;
