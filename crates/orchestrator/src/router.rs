//! Failure router
//!
//! Pure policy: maps one failure event (with the history window it carries)
//! to a decision. It never waits on the oracle.

use crate::config::RouterConfig;
use medic_core::{Decision, ErrorClass, FailureEvent, QuarantineReason};

#[derive(Debug, Clone)]
pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Classification-based quarantine is checked first so it wins over any
    /// count-based outcome.
    pub fn classify(&self, event: &FailureEvent) -> Decision {
        if let Some(signature) = self.repeated_logic_signature(event) {
            return Decision::QuarantineImmediate {
                reason: QuarantineReason::NonRecoverable { signature },
            };
        }

        let consecutive = event.consecutive_failures();
        if consecutive >= self.config.quarantine_threshold {
            return Decision::QuarantineImmediate {
                reason: QuarantineReason::FailureThreshold {
                    consecutive_failures: consecutive,
                },
            };
        }

        if event.class().is_transient() && consecutive <= self.config.local_retry_budget {
            Decision::LocalRetry
        } else {
            Decision::Escalate
        }
    }

    fn repeated_logic_signature(&self, event: &FailureEvent) -> Option<String> {
        if event.class() != ErrorClass::Logic {
            return None;
        }
        let signature = &event.error.signature;
        let repeats = event
            .health
            .recent_errors
            .iter()
            .filter(|e| e.class == ErrorClass::Logic && &e.signature == signature)
            .count();

        (repeats as u32 >= self.config.logic_repeat_limit).then(|| signature.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medic_core::{AgentId, ErrorSummary, HealthRecord, Utc, Uuid};
    use std::time::Duration;

    fn event_after(failures: &[(ErrorClass, &str)]) -> FailureEvent {
        let mut health = HealthRecord::with_windows(5, 10);
        let mut last = None;
        for (class, message) in failures {
            let summary = ErrorSummary::new(*class, *message);
            health.record_failure(summary.clone(), Duration::from_millis(1));
            last = Some(summary);
        }
        FailureEvent {
            id: Uuid::new_v4(),
            agent_id: AgentId::from("data_processor"),
            agent_type: "data_processor".into(),
            task_id: Uuid::new_v4(),
            error: last.unwrap(),
            health,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_transient_within_budget_retries_locally() {
        let router = Router::new(RouterConfig::default());
        let io = (ErrorClass::TransientIo, "connection reset");

        assert_eq!(router.classify(&event_after(&[io])), Decision::LocalRetry);
        assert_eq!(router.classify(&event_after(&[io, io])), Decision::LocalRetry);
        assert_eq!(router.classify(&event_after(&[io, io, io])), Decision::Escalate);
    }

    #[test]
    fn test_non_transient_within_budget_escalates() {
        let router = Router::new(RouterConfig::default());
        let event = event_after(&[(ErrorClass::ResourceExhaustion, "out of memory")]);
        assert_eq!(router.classify(&event), Decision::Escalate);
    }

    #[test]
    fn test_repeated_logic_signature_quarantines() {
        let router = Router::new(RouterConfig::default());
        let event = event_after(&[
            (ErrorClass::Logic, "division by zero at row 3"),
            (ErrorClass::Logic, "division by zero at row 9"),
        ]);

        assert_eq!(
            router.classify(&event),
            Decision::QuarantineImmediate {
                reason: QuarantineReason::NonRecoverable {
                    signature: "division by zero at row #".into()
                }
            }
        );
    }

    #[test]
    fn test_distinct_logic_errors_escalate() {
        let router = Router::new(RouterConfig::default());
        let event = event_after(&[
            (ErrorClass::Logic, "invalid header"),
            (ErrorClass::Logic, "missing field 'id'"),
        ]);
        assert_eq!(router.classify(&event), Decision::Escalate);
    }

    #[test]
    fn test_quarantine_threshold() {
        let router = Router::new(RouterConfig::default());
        let io = (ErrorClass::TransientIo, "timeout");
        let event = event_after(&[io; 10]);
        assert_eq!(
            router.classify(&event),
            Decision::QuarantineImmediate {
                reason: QuarantineReason::FailureThreshold {
                    consecutive_failures: 10
                }
            }
        );
    }
}
