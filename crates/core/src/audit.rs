//! Audit records for the healing path
//!
//! Every record is `{seq, timestamp, agent_id, kind, payload}`. The sequence
//! number is assigned by the appending log and disambiguates concurrent
//! writers; payloads are free-form JSON for external monitoring.

use crate::*;
use std::fmt;

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AgentRegistered,
    AgentDeregistered,
    HealingAttempt,
    HealingCoalesced,
    Quarantined,
    QuarantineReleased,
}

impl AuditKind {
    /// Dotted topic name for external sinks
    pub fn topic(&self) -> &'static str {
        match self {
            AuditKind::AgentRegistered => "agent.registered",
            AuditKind::AgentDeregistered => "agent.deregistered",
            AuditKind::HealingAttempt => "healing.attempt",
            AuditKind::HealingCoalesced => "healing.coalesced",
            AuditKind::Quarantined => "agent.quarantined",
            AuditKind::QuarantineReleased => "agent.quarantine_released",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// One entry of the append-only audit sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub kind: AuditKind,
    pub payload: serde_json::Value,
}
