//! Append-only audit log
//!
//! Sequence numbers are assigned under the log's lock, so concurrent writers
//! never reorder or collide. Live subscribers receive records in the same
//! order through a broadcast channel.

use medic_core::{AgentId, AuditKind, AuditRecord, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
    tx: broadcast::Sender<AuditRecord>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            records: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Append a record and return its sequence number (starting at 1)
    pub fn append(&self, agent_id: &AgentId, kind: AuditKind, payload: serde_json::Value) -> u64 {
        let mut records = self.records.lock();
        let record = AuditRecord {
            seq: records.len() as u64 + 1,
            timestamp: Utc::now(),
            agent_id: agent_id.clone(),
            kind,
            payload,
        };
        let seq = record.seq;
        debug!(seq, agent_id = %agent_id, kind = %kind, "Audit record appended");

        // No live subscribers is fine
        let _ = self.tx.send(record.clone());
        records.push(record);
        seq
    }

    /// Snapshot of every record so far
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, agent_id: &AgentId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| &r.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.records.lock().iter().filter(|r| r.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live stream of records appended after this call
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.tx.subscribe()
    }
}
