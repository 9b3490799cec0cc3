//! Constellation CLI - capital-aware task orchestration.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use constellation_core::{
    CapitalRequest, OrchestratorConfig, Task, TaskDeclaration, TaskFilter, TaskId, TaskKind,
    TaskResult, TaskState, TierName,
};
use constellation_execution::{CycleOutcome, CycleReport, InboxReport, IngestOutcome, Orchestrator, OrchestratorError};
use constellation_storage::{InboxItem, StoreError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "constellation")]
#[command(about = "Capital-aware task orchestration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, default_value = "constellation.toml")]
    config: PathBuf,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a new task
    Enqueue {
        /// Worker kind
        #[arg(required_unless_present = "file")]
        kind: Option<String>,
        /// Task ID (generated if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Priority, higher first
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i32,
        /// JSON payload handed to the worker
        #[arg(long)]
        payload: Option<String>,
        /// Tier to reserve capital from
        #[arg(long, requires = "amount")]
        tier: Option<String>,
        /// Capital to reserve
        #[arg(long, requires = "tier")]
        amount: Option<f64>,
        /// Read a task declaration from a JSON file instead
        #[arg(long, conflicts_with_all = ["kind", "id", "payload", "tier", "amount"])]
        file: Option<PathBuf>,
    },
    /// List tasks
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Filter by kind
        #[arg(long)]
        kind: Option<String>,
    },
    /// Show task details
    Show {
        /// Task ID
        id: String,
    },
    /// Run dispatch cycles
    Run {
        /// Number of cycles to run (forever if omitted)
        #[arg(long)]
        cycles: Option<usize>,
    },
    /// Reclaim timed-out assignments
    Sweep,
    /// Ingest a worker result
    Ingest {
        /// Result JSON file (stdin if omitted)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show tier and task status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent journal entries
    Events {
        /// Number of entries
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Rebase a tier's capacity
    ResetTier {
        /// Tier name
        tier: String,
        /// New capacity
        amount: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = OrchestratorConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Enqueue { kind, id, priority, payload, tier, amount, file } => {
            let decl = match file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str::<TaskDeclaration>(&text)?
                }
                None => TaskDeclaration {
                    id: id.map(TaskId::new).unwrap_or_else(TaskId::generate),
                    kind: TaskKind::new(kind.unwrap_or_default()),
                    payload: match payload {
                        Some(p) => serde_json::from_str(&p).context("payload is not valid JSON")?,
                        None => serde_json::Value::Null,
                    },
                    priority,
                    created_at: None,
                    capital: tier.zip(amount).map(|(tier, amount)| CapitalRequest {
                        tier: TierName::new(tier),
                        amount,
                    }),
                },
            };
            submit(config, InboxItem::Task(decl)).await?;
        }
        Commands::List { state, kind } => {
            let state = state
                .map(|s| s.parse::<TaskState>().map_err(anyhow::Error::msg))
                .transpose()?;
            let filter = TaskFilter {
                state: state.map(|s| vec![s]),
                kind: kind.map(TaskKind::new),
                ..Default::default()
            };
            let orch = Orchestrator::open_read_only(config).await?;
            let tasks = orch.list(&filter).await?;

            println!("Tasks ({})", tasks.len());
            for task in tasks {
                println!(
                    "  {} | {} | {} | {}{}",
                    task.id,
                    format_state(task.state),
                    task.priority,
                    task.kind,
                    format_capital(&task),
                );
            }
        }
        Commands::Show { id } => {
            let orch = Orchestrator::open_read_only(config).await?;
            let Some(task) = orch.task(&TaskId::new(id)).await? else {
                println!("Task not found");
                return Ok(());
            };

            println!("Task: {}", task.id);
            println!("  Kind: {}", task.kind);
            println!("  State: {}", format_state(task.state));
            println!("  Priority: {}", task.priority);
            println!("  Attempts: {}", task.attempt_count);
            if let Some(capital) = &task.capital {
                println!("  Capital: {} from {}", capital.amount, capital.tier);
            }
            println!("  Created: {}", task.created_at);
            if let Some(at) = task.assigned_at {
                println!("  Assigned: {}", at);
            }
            if let Some(at) = task.completed_at {
                println!("  Completed: {}", at);
            }
            if let Some(result) = &task.result {
                println!("  Result: {:?} (delta {:+})", result.outcome, result.capital_delta);
            }
            println!("  Payload: {}", task.payload);
        }
        Commands::Run { cycles } => {
            let orch = Orchestrator::open(config).await?;
            let ran = orch.run(cycles).await?;
            info!("Completed {} cycles", ran);
        }
        Commands::Sweep => {
            let orch = Orchestrator::open(config).await?;
            if let CycleOutcome::Ran(report) = orch.sweep().await? {
                print_report(&report);
            } else {
                println!("A dispatch cycle is running, try again later");
            }
        }
        Commands::Ingest { file } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let result: TaskResult = serde_json::from_str(&text).context("invalid result JSON")?;
            submit(config, InboxItem::Result(result)).await?;
        }
        Commands::Status { json } => {
            let orch = Orchestrator::open_read_only(config).await?;
            let status = orch.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("Constellation Status");
            println!("Tiers:");
            for tier in &status.tiers {
                println!(
                    "  {} | {:.2} / {:.2} (peak {:.2}) | dd {:.1}% / {:.1}% | {} | {} open",
                    tier.name,
                    tier.allocated,
                    tier.initial,
                    tier.peak,
                    tier.drawdown_from_initial * 100.0,
                    tier.drawdown_from_peak * 100.0,
                    tier.breaker_status,
                    tier.open_reservations,
                );
            }
            println!("Tasks: {}", status.tasks.total);
            for (state, count) in [
                (TaskState::Pending, status.tasks.pending),
                (TaskState::Assigned, status.tasks.assigned),
                (TaskState::Succeeded, status.tasks.succeeded),
                (TaskState::Failed, status.tasks.failed),
                (TaskState::Abandoned, status.tasks.abandoned),
            ] {
                if count > 0 {
                    println!("  {}: {}", format_state(state), count);
                }
            }
            if !status.workers.is_empty() {
                println!("Workers:");
            }
            for worker in &status.workers {
                let last_result = worker
                    .last_result
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".into());
                println!(
                    "  {} | {} | last result {}{}",
                    worker.name,
                    worker.kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(","),
                    last_result,
                    if worker.silent { " | SILENT" } else { "" },
                );
            }
        }
        Commands::Events { limit } => {
            let orch = Orchestrator::open_read_only(config).await?;
            for event in orch.events(Some(limit)).await? {
                let subject = event
                    .task_id
                    .as_ref()
                    .map(|t| t.to_string())
                    .or_else(|| event.tier.as_ref().map(|t| t.to_string()))
                    .unwrap_or_default();
                println!(
                    "  {} | {:?} | {} | {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.kind,
                    subject,
                    event.detail,
                );
            }
        }
        Commands::ResetTier { tier, amount } => {
            let orch = Orchestrator::open(config).await?;
            let status = orch.reset_tier(&TierName::new(tier), amount).await?;
            println!("Tier {} reset to {} ({})", status.name, status.allocated, status.breaker_status);
        }
    }

    Ok(())
}

/// Queue a submission, then apply it right away unless a running
/// orchestrator owns the data directory.
async fn submit(config: OrchestratorConfig, item: InboxItem) -> Result<()> {
    let path = Orchestrator::submit(&config, item).await?;
    let orch = match Orchestrator::open(config).await {
        Ok(orch) => orch,
        Err(OrchestratorError::Store(StoreError::Locked(_))) => {
            println!("Queued for the running orchestrator: {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let report = orch.drain_inbox().await?;
    print_inbox(&report);
    if !report.rejected.is_empty() {
        anyhow::bail!("{} submission(s) rejected", report.rejected.len());
    }
    Ok(())
}

fn print_inbox(report: &InboxReport) {
    for id in &report.enqueued {
        println!("Enqueued task: {}", id);
    }
    for outcome in &report.ingested {
        match outcome {
            IngestOutcome::Recorded { task, settlement } => {
                println!("Recorded {} as {}", task.id, format_state(task.state));
                if let Some(s) = settlement {
                    println!("  Tier {} now at {} (peak {})", s.tier, s.allocated, s.peak);
                }
            }
            IngestOutcome::Ignored { task_id, state } => {
                println!("Ignored result for {}: task is {}", task_id, format_state(*state));
            }
        }
    }
    for (path, reason) in &report.rejected {
        println!("Rejected {}: {}", path.display(), reason);
    }
}

fn print_report(report: &CycleReport) {
    println!("Requeued: {}", report.requeued.len());
    for id in &report.requeued {
        println!("  {}", id);
    }
    println!("Abandoned: {}", report.abandoned.len());
    for id in &report.abandoned {
        println!("  {}", id);
    }
    for error in &report.errors {
        println!("Error: {}", error.error);
    }
}

fn format_capital(task: &Task) -> String {
    task.capital
        .as_ref()
        .map(|c| format!(" | {} from {}", c.amount, c.tier))
        .unwrap_or_default()
}

fn format_state(state: TaskState) -> &'static str {
    match state {
        TaskState::Pending => "PENDING",
        TaskState::Assigned => "ASSIGNED",
        TaskState::Succeeded => "SUCCEEDED",
        TaskState::Failed => "FAILED",
        TaskState::Abandoned => "ABANDONED",
    }
}
