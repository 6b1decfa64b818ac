//! `medic simulate`: drive a small population of simulated workers through
//! the orchestrator and report how they healed

use crate::report::{self, SimulationReport, TaskTally};
use crate::workers::{Analytics, ApiGateway, DataProcessor};
use anyhow::{Context, Result};
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use medic_core::{AgentId, AuditKind, DiagnosisOracle, Task, Utc, Worker};
use orchestrator::{HttpOracle, MedicConfig, Orchestrator, RuleTableOracle, SubmitError, TaskHandle};
use rand::Rng;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

pub const PROCESSOR: &str = "data_processor";
pub const GATEWAY: &str = "api_gateway";
pub const ANALYTICS: &str = "analytics";
pub const AGENTS: [&str; 3] = [PROCESSOR, GATEWAY, ANALYTICS];

const PROCESSOR_OPERATIONS: &[&str] = &["transform", "validate", "analyze", "clean"];
const REPORT_TYPES: &[&str] = &["summary", "trend", "anomaly"];

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of tasks to submit across all agents
    #[arg(short, long, default_value_t = 90)]
    pub tasks: usize,

    /// Failure rate of the data processor
    #[arg(long, default_value_t = 0.15)]
    pub processor_failure_rate: f64,

    /// Failure rate of the API gateway backend
    #[arg(long, default_value_t = 0.08)]
    pub gateway_failure_rate: f64,

    /// Failure rate of the analytics agent
    #[arg(long, default_value_t = 0.05)]
    pub analytics_failure_rate: f64,

    /// Requests per client per second the gateway accepts
    #[arg(long, default_value_t = 25)]
    pub rate_limit: u32,

    /// Diagnosis endpoint; the built-in rule table is used when absent
    #[arg(long)]
    pub oracle_url: Option<String>,

    /// Bearer token for the diagnosis endpoint
    #[arg(long, env = "MEDIC_ORACLE_API_KEY", hide_env_values = true)]
    pub oracle_api_key: Option<String>,

    /// Print the report as JSON instead of tables
    #[arg(long)]
    pub json: bool,
}

impl SimulateArgs {
    pub async fn execute(&self, config: MedicConfig) -> Result<()> {
        let report = self.run(config, !self.json).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            report::print(&report);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("processor", self.processor_failure_rate),
            ("gateway", self.gateway_failure_rate),
            ("analytics", self.analytics_failure_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                anyhow::bail!("{name} failure rate must be within 0..=1, got {rate}");
            }
        }
        Ok(())
    }

    /// Fresh simulated workers, one per agent in `AGENTS` order
    pub fn workers(&self) -> [(&'static str, Arc<dyn Worker>); 3] {
        let processor: Arc<dyn Worker> = Arc::new(DataProcessor::new(self.processor_failure_rate));
        let gateway: Arc<dyn Worker> =
            Arc::new(ApiGateway::new(self.gateway_failure_rate, self.rate_limit));
        let analytics: Arc<dyn Worker> = Arc::new(Analytics::new(self.analytics_failure_rate));
        [
            (PROCESSOR, processor),
            (GATEWAY, gateway),
            (ANALYTICS, analytics),
        ]
    }

    /// Run the workload through the orchestrator and collect the report.
    /// `interactive` shows the progress bar and live healing events.
    pub async fn run(&self, config: MedicConfig, interactive: bool) -> Result<SimulationReport> {
        self.validate()?;

        let oracle = self.oracle(&config)?;
        let oracle_name = oracle.name().to_string();
        let orchestrator =
            Orchestrator::new(config, oracle).context("Invalid orchestrator configuration")?;
        for (id, worker) in self.workers() {
            orchestrator.register(id, id, worker)?;
        }
        info!(tasks = self.tasks, oracle = %oracle_name, "Starting simulation");

        let progress = progress_bar(self.tasks as u64, !interactive);
        let events = spawn_event_printer(&orchestrator, progress.clone(), !interactive);

        let started = Instant::now();
        let tally = self.drive(&orchestrator, &progress).await;
        progress.finish_with_message("done");

        orchestrator.shutdown().await;
        events.abort();

        Ok(SimulationReport::collect(
            &orchestrator,
            &oracle_name,
            tally,
            started.elapsed(),
        ))
    }

    fn oracle(&self, config: &MedicConfig) -> Result<Arc<dyn DiagnosisOracle>> {
        match &self.oracle_url {
            Some(url) => {
                let mut oracle = HttpOracle::new(url.clone(), config.healing.oracle_timeout())?;
                if let Some(key) = &self.oracle_api_key {
                    oracle = oracle.with_api_key(key.clone());
                }
                Ok(Arc::new(oracle))
            }
            None => Ok(Arc::new(RuleTableOracle::default())),
        }
    }

    /// Submit every task, waiting on the oldest pending one whenever a queue
    /// is full. Returns per-agent task counts.
    async fn drive(
        &self,
        orchestrator: &Orchestrator,
        progress: &ProgressBar,
    ) -> BTreeMap<String, TaskTally> {
        let agents = AGENTS.map(AgentId::from);
        let mut pending: VecDeque<TaskHandle> = VecDeque::new();
        let mut tally: BTreeMap<String, TaskTally> = BTreeMap::new();

        for i in 0..self.tasks {
            let agent = &agents[i % agents.len()];
            let mut task = workload(agent, i);

            loop {
                match orchestrator.submit(agent, task) {
                    Ok(handle) => {
                        pending.push_back(handle);
                        break;
                    }
                    Err(SubmitError::QueueFull { .. }) if !pending.is_empty() => {
                        if let Some(oldest) = pending.pop_front() {
                            finish(oldest, progress, &mut tally).await;
                        }
                        task = workload(agent, i);
                    }
                    Err(err) => {
                        debug!(agent_id = %agent, error = %err, "Submission refused");
                        let entry = tally.entry(agent.to_string()).or_default();
                        entry.tasks += 1;
                        entry.refused += 1;
                        progress.inc(1);
                        break;
                    }
                }
            }
        }

        while let Some(handle) = pending.pop_front() {
            finish(handle, progress, &mut tally).await;
        }
        tally
    }
}

async fn finish(handle: TaskHandle, progress: &ProgressBar, tally: &mut BTreeMap<String, TaskTally>) {
    let agent_id = handle.agent_id().clone();
    let outcome = handle.wait().await;
    debug!(agent_id = %agent_id, outcome = ?outcome, "Task finished");

    let entry = tally.entry(agent_id.to_string()).or_default();
    entry.tasks += 1;
    if outcome.is_completed() {
        entry.completed += 1;
    }
    progress.inc(1);
}

/// The task submitted as number `index` of a run
pub fn workload(agent: &AgentId, index: usize) -> Task {
    match agent.as_str() {
        PROCESSOR => Task::new(
            PROCESSOR_OPERATIONS[index % PROCESSOR_OPERATIONS.len()],
            json!({
                "id": index,
                "timestamp": Utc::now().to_rfc3339(),
                "name": format!("record-{index}"),
                "note": if index % 3 == 0 { serde_json::Value::Null } else { json!("ok") },
            }),
        ),
        GATEWAY => Task::new(
            "request",
            json!({
                "endpoint": "/api/items",
                "method": "GET",
                "client_id": format!("client-{}", index % 4),
            }),
        ),
        _ => {
            let mut rng = rand::rng();
            let metrics: Vec<f64> = (0..8).map(|_| rng.random_range(0.0..100.0)).collect();
            Task::new(
                REPORT_TYPES[index % REPORT_TYPES.len()],
                json!({ "metrics": metrics }),
            )
        }
    }
}

fn progress_bar(len: u64, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    bar.set_style(style);
    bar
}

/// Print healing and quarantine events above the progress bar as they happen
fn spawn_event_printer(
    orchestrator: &Orchestrator,
    progress: ProgressBar,
    quiet: bool,
) -> tokio::task::JoinHandle<()> {
    let mut events = orchestrator.audit().subscribe();
    tokio::spawn(async move {
        loop {
            let record = match events.recv().await {
                Ok(record) => record,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            if quiet {
                continue;
            }
            let line = match record.kind {
                AuditKind::HealingAttempt => format!(
                    "{} {} healing: {}",
                    style("[heal]").green(),
                    record.agent_id,
                    report::describe_attempt(&record.payload)
                ),
                AuditKind::HealingCoalesced => format!(
                    "{} {} joined in-flight healing",
                    style("[wait]").dim(),
                    record.agent_id
                ),
                AuditKind::Quarantined => format!(
                    "{} {} quarantined: {}",
                    style("[quar]").red().bold(),
                    record.agent_id,
                    record.payload["message"].as_str().unwrap_or("unknown reason")
                ),
                _ => continue,
            };
            progress.println(line);
        }
    })
}
