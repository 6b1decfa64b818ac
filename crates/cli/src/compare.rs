//! `medic compare`: the same workload with and without self-healing
//!
//! The baseline executes every task exactly once against fresh workers and
//! only counts failures: no retries, no breaker, no oracle, no quarantine.

use crate::report::{self, BaselineRow, BaselineStatus, ComparisonReport, TaskTally};
use crate::simulate::{workload, SimulateArgs, AGENTS};
use anyhow::Result;
use clap::Args;
use indicatif::ProgressBar;
use medic_core::{AgentId, ErrorSummary, HealthRecord, Task, TaskError, Worker};
use orchestrator::{classify_error, MedicConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Args)]
pub struct CompareArgs {
    #[command(flatten)]
    pub workload: SimulateArgs,
}

impl CompareArgs {
    pub async fn execute(&self, config: MedicConfig) -> Result<()> {
        self.workload.validate()?;
        let interactive = !self.workload.json;

        let baseline = run_baseline(&self.workload, interactive).await;
        let healing = self.workload.run(config, interactive).await?;
        let report = ComparisonReport::new(baseline, healing);

        if self.workload.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            report::print_comparison(&report);
        }
        Ok(())
    }
}

/// Run the workload directly against fresh workers, one attempt per task
pub async fn run_baseline(args: &SimulateArgs, interactive: bool) -> Vec<BaselineRow> {
    let workers = args.workers();
    let mut health: Vec<HealthRecord> = workers.iter().map(|_| HealthRecord::default()).collect();
    let mut by_class: Vec<BTreeMap<String, u64>> = workers.iter().map(|_| BTreeMap::new()).collect();

    let progress = if interactive {
        ProgressBar::new(args.tasks as u64).with_message("baseline")
    } else {
        ProgressBar::hidden()
    };
    info!(tasks = args.tasks, "Starting baseline run");

    for i in 0..args.tasks {
        let slot = i % AGENTS.len();
        let (id, worker) = &workers[slot];
        let task = workload(&AgentId::from(*id), i);

        let started = Instant::now();
        let result = execute_once(worker, &task).await;
        let latency = started.elapsed();

        match result {
            Ok(()) => health[slot].record_success(latency),
            Err(error) => {
                let class = classify_error(&error);
                debug!(agent_id = %id, class = %class, error = %error, "Baseline task failed");
                *by_class[slot].entry(class.to_string()).or_insert(0) += 1;
                health[slot].record_failure(ErrorSummary::new(class, error.to_string()), latency);
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    workers
        .iter()
        .zip(health)
        .zip(by_class)
        .map(|(((id, _), health), failures_by_class)| BaselineRow {
            agent_id: id.to_string(),
            tally: TaskTally {
                tasks: health.total_attempts,
                completed: health.total_attempts - health.total_failures,
                refused: 0,
            },
            status: BaselineStatus::from_failures(health.total_failures),
            failures_by_class,
        })
        .collect()
}

async fn execute_once(worker: &Arc<dyn Worker>, task: &Task) -> Result<(), TaskError> {
    worker.execute(task).await.map(|_| ())
}
