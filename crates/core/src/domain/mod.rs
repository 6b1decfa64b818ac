//! Domain models for Medic

use crate::*;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Identifier of a registered agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unit of work submitted to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Free-form operation name understood by the worker
    pub kind: String,
    pub payload: serde_json::Value,
    /// Per-task timeout; the runtime default applies when absent
    pub timeout_ms: Option<u64>,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            timeout_ms: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Output produced by a successful task
pub type TaskOutput = serde_json::Value;

/// Fixed failure taxonomy used by the runtime and the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientIo,
    ResourceExhaustion,
    Logic,
    Unknown,
}

impl ErrorClass {
    /// Only transient I/O failures are eligible for a blind local retry
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::TransientIo)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::TransientIo => write!(f, "transient_io"),
            ErrorClass::ResourceExhaustion => write!(f, "resource_exhaustion"),
            ErrorClass::Logic => write!(f, "logic"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classified summary of a single failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub class: ErrorClass,
    /// Normalized message used to detect repeated identical failures
    pub signature: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorSummary {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class,
            signature: normalize_signature(&message),
            message,
            at: Utc::now(),
        }
    }
}

/// Lowercases the message and collapses digit runs so that failures which
/// differ only in ids or counters share one signature.
pub fn normalize_signature(message: &str) -> String {
    let mut signature = String::with_capacity(message.len());
    let mut in_digits = false;

    for ch in message.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_digit() {
            if !in_digits {
                signature.push('#');
            }
            in_digits = true;
        } else {
            in_digits = false;
            signature.push(ch);
        }
    }

    if let Some((idx, _)) = signature.char_indices().nth(160) {
        signature.truncate(idx);
    }
    signature
}

/// Per-agent health counters.
///
/// Owned by exactly one agent and mutated only by that agent's runtime (and by
/// the healing coordinator when it applies a plan), always under the agent's
/// lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub total_attempts: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    /// Attempts refused by an open circuit without running the task
    pub rejected: u64,
    pub last_error: Option<ErrorSummary>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cumulative_latency_ms: u64,
    pub recent_errors: VecDeque<ErrorSummary>,
    pub latency_samples_ms: VecDeque<u64>,
    history_window: usize,
    latency_window: usize,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::with_windows(5, 100)
    }
}

impl HealthRecord {
    pub fn with_windows(history_window: usize, latency_window: usize) -> Self {
        Self {
            total_attempts: 0,
            consecutive_failures: 0,
            total_failures: 0,
            rejected: 0,
            last_error: None,
            last_success_at: None,
            last_failure_at: None,
            cumulative_latency_ms: 0,
            recent_errors: VecDeque::with_capacity(history_window),
            latency_samples_ms: VecDeque::with_capacity(latency_window),
            history_window: history_window.max(1),
            latency_window: latency_window.max(1),
        }
    }

    /// A success ends the failure episode: the streak and the recent error
    /// window both start over.
    pub fn record_success(&mut self, latency: Duration) {
        self.total_attempts += 1;
        self.consecutive_failures = 0;
        self.recent_errors.clear();
        self.last_success_at = Some(Utc::now());
        self.push_latency(latency);
    }

    pub fn record_failure(&mut self, error: ErrorSummary, latency: Duration) {
        self.total_attempts += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_failure_at = Some(error.at);

        if self.recent_errors.len() == self.history_window {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error.clone());
        self.last_error = Some(error);
        self.push_latency(latency);
    }

    pub fn record_rejection(&mut self) {
        self.rejected += 1;
    }

    /// Clears the failure streak. The recent error window is kept until the
    /// next success so a repeated identical error is still recognized after a
    /// reset.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Forget the recent error window (manual release)
    pub fn clear_history(&mut self) {
        self.recent_errors.clear();
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.latency_samples_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.latency_samples_ms.iter().sum();
        Some(Duration::from_millis(sum / self.latency_samples_ms.len() as u64))
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            1.0
        } else {
            (self.total_attempts - self.total_failures) as f64 / self.total_attempts as f64
        }
    }

    fn push_latency(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.cumulative_latency_ms = self.cumulative_latency_ms.saturating_add(ms);
        if self.latency_samples_ms.len() == self.latency_window {
            self.latency_samples_ms.pop_front();
        }
        self.latency_samples_ms.push_back(ms);
    }
}

/// Immutable snapshot emitted once per failed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub agent_type: String,
    pub task_id: Uuid,
    pub error: ErrorSummary,
    pub health: HealthRecord,
    pub timestamp: DateTime<Utc>,
}

impl FailureEvent {
    pub fn consecutive_failures(&self) -> u32 {
        self.health.consecutive_failures
    }

    pub fn class(&self) -> ErrorClass {
        self.error.class
    }
}

/// Router verdict for one failure event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    LocalRetry,
    Escalate,
    QuarantineImmediate { reason: QuarantineReason },
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::LocalRetry => write!(f, "LOCAL_RETRY"),
            Decision::Escalate => write!(f, "ESCALATE"),
            Decision::QuarantineImmediate { .. } => write!(f, "QUARANTINE_IMMEDIATE"),
        }
    }
}

/// Why an agent was removed from the eligible pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuarantineReason {
    /// The same logic error keeps recurring
    NonRecoverable { signature: String },
    /// Consecutive failures reached the quarantine threshold
    FailureThreshold { consecutive_failures: u32 },
    /// The diagnosis oracle prescribed quarantine
    Prescribed,
    /// A coalesced healing request failed twice
    HealingExhausted,
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::NonRecoverable { signature } => {
                write!(f, "non-recoverable error '{signature}'")
            }
            QuarantineReason::FailureThreshold {
                consecutive_failures,
            } => write!(f, "{consecutive_failures} consecutive failures"),
            QuarantineReason::Prescribed => write!(f, "prescribed by diagnosis"),
            QuarantineReason::HealingExhausted => write!(f, "healing retries exhausted"),
        }
    }
}

/// Context handed to the diagnosis oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingRequest {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub agent_type: String,
    /// FailureEvent this request was created from
    pub origin_event: Uuid,
    pub error_class: ErrorClass,
    pub error_message: String,
    pub signature: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub recent_errors: Vec<ErrorSummary>,
    pub created_at: DateTime<Utc>,
}

impl HealingRequest {
    pub fn from_event(event: &FailureEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: event.agent_id.clone(),
            agent_type: event.agent_type.clone(),
            origin_event: event.id,
            error_class: event.error.class,
            error_message: event.error.message.clone(),
            signature: event.error.signature.clone(),
            consecutive_failures: event.health.consecutive_failures,
            total_failures: event.health.total_failures,
            recent_errors: event.health.recent_errors.iter().cloned().collect(),
            created_at: Utc::now(),
        }
    }
}

/// Recovery strategy prescribed by the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealingStrategy {
    /// Adjust the breaker backoff and allow an early probe
    RetryWithBackoff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff_ms: Option<u64>,
    },
    /// Clear the failure streak and close the breaker
    ResetState,
    /// Hand a replacement configuration to the agent
    ApplyPatch { payload: serde_json::Value },
    Quarantine,
}

impl HealingStrategy {
    pub fn tag(&self) -> &'static str {
        match self {
            HealingStrategy::RetryWithBackoff { .. } => "RETRY_WITH_BACKOFF",
            HealingStrategy::ResetState => "RESET_STATE",
            HealingStrategy::ApplyPatch { .. } => "APPLY_PATCH",
            HealingStrategy::Quarantine => "QUARANTINE",
        }
    }
}

impl fmt::Display for HealingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Plan returned by the diagnosis oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingPlan {
    #[serde(flatten)]
    pub strategy: HealingStrategy,
    /// Oracle confidence in `[0.0, 1.0]`
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

impl HealingPlan {
    pub fn new(strategy: HealingStrategy) -> Self {
        Self {
            strategy,
            confidence: 1.0,
            rationale: None,
        }
    }

    pub fn retry_with_backoff(backoff: Option<Duration>) -> Self {
        Self::new(HealingStrategy::RetryWithBackoff {
            backoff_ms: backoff.map(|d| d.as_millis() as u64),
        })
    }

    pub fn reset_state() -> Self {
        Self::new(HealingStrategy::ResetState)
    }

    pub fn apply_patch(payload: serde_json::Value) -> Self {
        Self::new(HealingStrategy::ApplyPatch { payload })
    }

    pub fn quarantine() -> Self {
        Self::new(HealingStrategy::Quarantine)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// A plan is usable when its confidence is finite and within bounds
    pub fn is_valid(&self, min_confidence: f64) -> bool {
        self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && self.confidence >= min_confidence
    }
}

/// How a healing attempt ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealingStatus {
    /// The oracle plan was applied
    Applied,
    /// The oracle failed; the default backoff strategy stayed in effect
    Fallback { reason: String },
    /// The plan could not be applied
    Failed { reason: String },
    /// The agent ended up quarantined
    Quarantined { reason: QuarantineReason },
}

/// Result of `HealingCoordinator::heal`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingOutcome {
    pub request_id: Uuid,
    pub agent_id: AgentId,
    pub status: HealingStatus,
    pub strategy: Option<HealingStrategy>,
    pub oracle_latency_ms: Option<u64>,
    /// True when this outcome was reused from another in-flight healing
    pub coalesced: bool,
    pub completed_at: DateTime<Utc>,
}

impl HealingOutcome {
    pub fn failed(&self) -> bool {
        matches!(self.status, HealingStatus::Failed { .. })
    }
}
