//! Simulation report: per-agent health, orchestrator counters and audit summary,
//! plus the side-by-side view of a healing run and its baseline

use console::style;
use medic_core::AuditKind;
use orchestrator::{CircuitBreakerState, Orchestrator, StatsSnapshot};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Task-level counts for one agent. A task completed when its outcome was a
/// success, however many attempts it took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskTally {
    pub tasks: u64,
    pub completed: u64,
    pub refused: u64,
}

impl TaskTally {
    pub fn success_rate(&self) -> f64 {
        if self.tasks == 0 {
            1.0
        } else {
            self.completed as f64 / self.tasks as f64
        }
    }

    fn add(&mut self, other: &TaskTally) {
        self.tasks += other.tasks;
        self.completed += other.completed;
        self.refused += other.refused;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRow {
    pub agent_id: String,
    pub agent_type: String,
    pub attempts: u64,
    pub failures: u64,
    pub rejected: u64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<u64>,
    pub breaker: CircuitBreakerState,
    pub times_opened: u64,
    pub quarantine: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub oracle: String,
    pub duration_ms: u64,
    pub refused_submissions: u64,
    pub stats: StatsSnapshot,
    pub oracle_calls: u64,
    pub agents: Vec<AgentRow>,
    pub tasks: BTreeMap<String, TaskTally>,
    pub audit: BTreeMap<String, usize>,
}

impl SimulationReport {
    pub fn collect(
        orchestrator: &Orchestrator,
        oracle: &str,
        tasks: BTreeMap<String, TaskTally>,
        elapsed: Duration,
    ) -> Self {
        let agents = orchestrator
            .agents()
            .into_iter()
            .map(|agent| AgentRow {
                agent_id: agent.agent_id.to_string(),
                agent_type: agent.agent_type,
                attempts: agent.health.total_attempts,
                failures: agent.health.total_failures,
                rejected: agent.health.rejected,
                success_rate: agent.health.success_rate(),
                avg_latency_ms: agent
                    .health
                    .average_latency()
                    .map(|d| d.as_millis() as u64),
                breaker: agent.breaker.state,
                times_opened: agent.breaker.times_opened,
                quarantine: agent.quarantine.map(|reason| reason.to_string()),
            })
            .collect();

        let mut audit = BTreeMap::new();
        for record in orchestrator.audit().records() {
            *audit.entry(record.kind.topic().to_string()).or_insert(0) += 1;
        }

        Self {
            oracle: oracle.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            refused_submissions: tasks.values().map(|t| t.refused).sum(),
            stats: orchestrator.stats(),
            oracle_calls: orchestrator.coordinator().oracle_calls(),
            agents,
            tasks,
            audit,
        }
    }

    pub fn total(&self) -> TaskTally {
        let mut total = TaskTally::default();
        for tally in self.tasks.values() {
            total.add(tally);
        }
        total
    }
}

/// Baseline agent state after a run, by total failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineStatus {
    Healthy,
    Degraded,
    Failed,
}

impl BaselineStatus {
    pub fn from_failures(failures: u64) -> Self {
        match failures {
            0..=3 => BaselineStatus::Healthy,
            4..=10 => BaselineStatus::Degraded,
            _ => BaselineStatus::Failed,
        }
    }
}

/// One agent of the baseline run: every task executed once, failures only counted
#[derive(Debug, Clone, Serialize)]
pub struct BaselineRow {
    pub agent_id: String,
    pub tally: TaskTally,
    pub failures_by_class: BTreeMap<String, u64>,
    pub status: BaselineStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub baseline_success_rate: f64,
    pub healing_success_rate: f64,
    /// Relative gain of the healing run; absent when the baseline never succeeded
    pub improvement_pct: Option<f64>,
    pub baseline: Vec<BaselineRow>,
    pub healing: SimulationReport,
}

impl ComparisonReport {
    pub fn new(baseline: Vec<BaselineRow>, healing: SimulationReport) -> Self {
        let mut total = TaskTally::default();
        for row in &baseline {
            total.add(&row.tally);
        }
        let baseline_success_rate = total.success_rate();
        let healing_success_rate = healing.total().success_rate();
        let improvement_pct = (baseline_success_rate > 0.0).then(|| {
            (healing_success_rate - baseline_success_rate) / baseline_success_rate * 100.0
        });

        Self {
            baseline_success_rate,
            healing_success_rate,
            improvement_pct,
            baseline,
            healing,
        }
    }
}

/// One-line description of a healing attempt audit payload
pub fn describe_attempt(payload: &Value) -> String {
    let strategy = payload["plan"]["strategy"].as_str().unwrap_or("-");
    match payload["status"]["status"].as_str() {
        Some("applied") => format!("{strategy} applied"),
        Some("fallback") => format!(
            "fallback to backoff ({})",
            payload["status"]["reason"].as_str().unwrap_or("oracle failed")
        ),
        Some("failed") => format!(
            "{strategy} failed ({})",
            payload["status"]["reason"].as_str().unwrap_or("unknown")
        ),
        Some("quarantined") => "agent quarantined".to_string(),
        _ => "unknown outcome".to_string(),
    }
}

fn breaker_cell(state: CircuitBreakerState) -> String {
    let label = format!("{:<9}", state.to_string());
    match state {
        CircuitBreakerState::Closed => style(label).green().to_string(),
        CircuitBreakerState::HalfOpen => style(label).yellow().to_string(),
        CircuitBreakerState::Open => style(label).red().to_string(),
    }
}

pub fn print(report: &SimulationReport) {
    println!();
    println!(
        "{} {} tasks in {:.1}s using the {} oracle",
        style("Simulation finished:").bold(),
        report.stats.submitted + report.refused_submissions,
        report.duration_ms as f64 / 1000.0,
        style(&report.oracle).cyan()
    );
    println!();

    println!(
        "{}",
        style(format!(
            "{:<16} {:>8} {:>8} {:>8} {:>8} {:>9} {:<9} {:>6}  {}",
            "AGENT", "ATTEMPTS", "FAILURES", "REJECTED", "SUCCESS", "LATENCY", "BREAKER", "OPENED", "QUARANTINE"
        ))
        .bold()
        .underlined()
    );
    for agent in &report.agents {
        let quarantine = match &agent.quarantine {
            Some(reason) => style(reason.clone()).red().to_string(),
            None => style("-".to_string()).dim().to_string(),
        };
        println!(
            "{:<16} {:>8} {:>8} {:>8} {:>7.1}% {:>9} {} {:>6}  {}",
            agent.agent_id,
            agent.attempts,
            agent.failures,
            agent.rejected,
            agent.success_rate * 100.0,
            agent
                .avg_latency_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string()),
            breaker_cell(agent.breaker),
            agent.times_opened,
            quarantine
        );
    }

    let stats = &report.stats;
    let total = report.total();
    println!();
    println!("{}", style("Outcomes").bold());
    println!(
        "  tasks {}  completed {:.1}%",
        total.tasks,
        total.success_rate() * 100.0
    );
    println!(
        "  completed {}  failed {}  rejected {}  cancelled {}  refused {}",
        style(stats.completed).green(),
        style(stats.failed).red(),
        style(stats.rejected).yellow(),
        stats.cancelled,
        report.refused_submissions
    );
    println!(
        "  local retries {}  escalations {}  oracle calls {}  quarantines {}",
        stats.local_retries, stats.escalations, report.oracle_calls, stats.quarantines
    );

    println!();
    println!("{}", style("Audit").bold());
    for (topic, count) in &report.audit {
        println!("  {topic:<28} {count}");
    }
    if report.audit.contains_key(AuditKind::Quarantined.topic()) {
        println!();
        println!(
            "{}",
            style("Quarantined agents stay out of service until released.").yellow()
        );
    }
}

pub fn print_comparison(report: &ComparisonReport) {
    println!();
    println!(
        "{} {} tasks per run",
        style("Baseline vs self-healing:").bold(),
        report.healing.total().tasks
    );
    println!();
    println!(
        "{}",
        style(format!(
            "{:<16} {:>9} {:>9} {:>9}  {}",
            "AGENT", "BASELINE", "HEALING", "DELTA", "BASELINE STATUS"
        ))
        .bold()
        .underlined()
    );
    for row in &report.baseline {
        let healing = report
            .healing
            .tasks
            .get(&row.agent_id)
            .copied()
            .unwrap_or_default();
        let delta = (healing.success_rate() - row.tally.success_rate()) * 100.0;
        let status = match row.status {
            BaselineStatus::Healthy => style("healthy").green(),
            BaselineStatus::Degraded => style("degraded").yellow(),
            BaselineStatus::Failed => style("failed").red(),
        };
        println!(
            "{:<16} {:>8.1}% {:>8.1}% {:>+8.1}  {}",
            row.agent_id,
            row.tally.success_rate() * 100.0,
            healing.success_rate() * 100.0,
            delta,
            status
        );
    }

    println!();
    println!(
        "  baseline {:.1}%  self-healing {:.1}%  improvement {}",
        report.baseline_success_rate * 100.0,
        report.healing_success_rate * 100.0,
        report
            .improvement_pct
            .map(|pct| format!("{pct:+.1}%"))
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "  healing used {} local retries, {} escalations and {} quarantines",
        report.healing.stats.local_retries,
        report.healing.stats.escalations,
        report.healing.stats.quarantines
    );
}
