//! Static rule table oracle
//!
//! First matching rule wins. Rules match on the error class (or any class)
//! and a minimum consecutive-failure count.

use async_trait::async_trait;
use medic_core::{DiagnosisOracle, ErrorClass, HealingPlan, HealingRequest, OracleError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OracleRule {
    /// `None` matches every class
    pub class: Option<ErrorClass>,
    pub min_consecutive_failures: u32,
    pub plan: HealingPlan,
}

impl OracleRule {
    pub fn new(class: Option<ErrorClass>, plan: HealingPlan) -> Self {
        Self {
            class,
            min_consecutive_failures: 0,
            plan,
        }
    }

    pub fn when_failures_reach(mut self, count: u32) -> Self {
        self.min_consecutive_failures = count;
        self
    }

    fn matches(&self, request: &HealingRequest) -> bool {
        self.class.map_or(true, |class| class == request.error_class)
            && request.consecutive_failures >= self.min_consecutive_failures
    }
}

#[derive(Debug)]
pub struct RuleTableOracle {
    name: String,
    rules: Vec<OracleRule>,
    calls: AtomicU64,
}

impl Default for RuleTableOracle {
    fn default() -> Self {
        Self::new(vec![
            OracleRule::new(
                Some(ErrorClass::TransientIo),
                HealingPlan::retry_with_backoff(None)
                    .with_confidence(0.85)
                    .with_rationale("transient I/O failure, probe again after backoff"),
            ),
            OracleRule::new(
                Some(ErrorClass::ResourceExhaustion),
                HealingPlan::retry_with_backoff(Some(Duration::from_secs(30)))
                    .with_confidence(0.8)
                    .with_rationale("resource pressure, give the agent a longer cool-down"),
            ),
            OracleRule::new(
                Some(ErrorClass::Logic),
                HealingPlan::reset_state()
                    .with_confidence(0.7)
                    .with_rationale("logic error, clear accumulated state"),
            ),
            OracleRule::new(
                None,
                HealingPlan::reset_state()
                    .with_confidence(0.6)
                    .with_rationale("unclassified failure, reset and observe"),
            ),
        ])
    }
}

impl RuleTableOracle {
    pub fn new(rules: Vec<OracleRule>) -> Self {
        Self {
            name: "rule-table".to_string(),
            rules,
            calls: AtomicU64::new(0),
        }
    }

    /// Table with a single catch-all rule
    pub fn always(plan: HealingPlan) -> Self {
        Self::new(vec![OracleRule::new(None, plan)])
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Insert a rule ahead of the existing ones
    pub fn with_rule(mut self, rule: OracleRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DiagnosisOracle for RuleTableOracle {
    async fn diagnose(&self, request: &HealingRequest) -> Result<HealingPlan, OracleError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.rules
            .iter()
            .find(|rule| rule.matches(request))
            .map(|rule| rule.plan.clone())
            .ok_or_else(|| {
                OracleError::Unavailable(format!(
                    "no rule for {} after {} failures",
                    request.error_class, request.consecutive_failures
                ))
            })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medic_core::{AgentId, HealingStrategy, Utc, Uuid};

    fn request(class: ErrorClass, consecutive_failures: u32) -> HealingRequest {
        HealingRequest {
            id: Uuid::new_v4(),
            agent_id: AgentId::from("api_gateway"),
            agent_type: "api_gateway".into(),
            origin_event: Uuid::new_v4(),
            error_class: class,
            error_message: "boom".into(),
            signature: "boom".into(),
            consecutive_failures,
            total_failures: consecutive_failures as u64,
            recent_errors: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_default_table() {
        let oracle = RuleTableOracle::default();

        let plan = oracle.diagnose(&request(ErrorClass::TransientIo, 3)).await.unwrap();
        assert_eq!(plan.strategy, HealingStrategy::RetryWithBackoff { backoff_ms: None });

        let plan = oracle.diagnose(&request(ErrorClass::Logic, 1)).await.unwrap();
        assert_eq!(plan.strategy, HealingStrategy::ResetState);

        let plan = oracle.diagnose(&request(ErrorClass::Unknown, 1)).await.unwrap();
        assert_eq!(plan.strategy, HealingStrategy::ResetState);
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_prepended_rule_with_threshold() {
        let oracle = RuleTableOracle::default().with_rule(
            OracleRule::new(Some(ErrorClass::TransientIo), HealingPlan::quarantine())
                .when_failures_reach(6),
        );

        let early = oracle.diagnose(&request(ErrorClass::TransientIo, 3)).await.unwrap();
        assert_ne!(early.strategy, HealingStrategy::Quarantine);

        let late = oracle.diagnose(&request(ErrorClass::TransientIo, 6)).await.unwrap();
        assert_eq!(late.strategy, HealingStrategy::Quarantine);
    }

    #[tokio::test]
    async fn test_empty_table_is_unavailable() {
        let oracle = RuleTableOracle::new(Vec::new());
        let err = oracle.diagnose(&request(ErrorClass::Logic, 1)).await.unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }
}
