//! Run command handlers
//!
//! Listing, inspecting, triggering, cancelling and following runs.

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use colored::*;
use shipway_client::OrchestratorClient;
use shipway_core::domain::run::{Run, RunOutcome, RunStatus, StageStatus};
use shipway_core::dto::run::{RunSummary, TriggerRun};
use std::time::Duration;
use uuid::Uuid;

use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List runs in admission order
    List {
        /// Only show runs in this status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    /// Show one run with its stages
    Get {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// List the artifacts a run produced
    Artifacts {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Start a run for a commit
    Trigger {
        /// Commit id
        commit: String,

        /// Branch the commit is on (defaults to the pipeline's branch)
        #[arg(long)]
        branch: Option<String>,

        /// Follow the run until it finishes
        #[arg(short, long)]
        watch: bool,
    },
    /// Cancel a queued or running run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Follow a run until it finishes
    Watch {
        /// Run ID or unambiguous prefix
        id: String,

        /// Seconds between polls
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusFilter {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for RunStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Queued => RunStatus::Queued,
            StatusFilter::Running => RunStatus::Running,
            StatusFilter::Succeeded => RunStatus::Succeeded,
            StatusFilter::Failed => RunStatus::Failed,
            StatusFilter::Cancelled => RunStatus::Cancelled,
        }
    }
}

pub async fn handle_run_command(command: RunCommands, client: &OrchestratorClient) -> Result<()> {
    match command {
        RunCommands::List { status } => list_runs(client, status.map(RunStatus::from)).await,
        RunCommands::Get { id } => get_run(client, &id).await,
        RunCommands::Artifacts { id } => list_artifacts(client, &id).await,
        RunCommands::Trigger {
            commit,
            branch,
            watch,
        } => trigger_run(client, commit, branch, watch).await,
        RunCommands::Cancel { id } => cancel_run(client, &id).await,
        RunCommands::Watch { id, interval } => {
            let run_id = resolve_run_id(client, &IdOrPrefix::parse(&id)).await?;
            watch_run(client, run_id, Duration::from_secs(interval.max(1))).await
        }
    }
}

async fn list_runs(client: &OrchestratorClient, status: Option<RunStatus>) -> Result<()> {
    let runs = client.list_runs(status).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in runs {
            print_run_summary(&run);
        }
    }

    Ok(())
}

async fn get_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let run_id = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let run = client.get_run(run_id).await?;

    print_run_details(&run);
    Ok(())
}

async fn list_artifacts(client: &OrchestratorClient, id: &str) -> Result<()> {
    let run_id = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let artifacts = client.list_artifacts(run_id).await?;

    if artifacts.is_empty() {
        println!("{}", "No artifacts produced yet.".yellow());
        return Ok(());
    }

    for artifact in artifacts {
        println!(
            "  {} {} ({} bytes, {}) {}",
            "▸".cyan(),
            artifact.name.bold(),
            artifact.size,
            artifact.producer,
            artifact.fingerprint.dimmed()
        );
    }

    Ok(())
}

async fn trigger_run(
    client: &OrchestratorClient,
    commit: String,
    branch: Option<String>,
    watch: bool,
) -> Result<()> {
    let run = client
        .trigger_run(TriggerRun {
            branch,
            commit_id: commit,
        })
        .await?;

    println!(
        "{} Run #{} queued for {} ({})",
        "✓".green(),
        run.sequence,
        run.commit,
        run.id.to_string().dimmed()
    );

    if watch {
        watch_run(client, run.id, Duration::from_secs(2)).await?;
    }

    Ok(())
}

async fn cancel_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let run_id = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;

    match client.cancel_run(run_id).await {
        Ok(run) => {
            println!(
                "{} Cancellation requested for run #{} ({})",
                "✓".green(),
                run.sequence,
                run.commit
            );
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!("{}", format!("Run {} has already finished.", run_id).yellow());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Polls a run and prints each stage transition until it finishes
async fn watch_run(client: &OrchestratorClient, run_id: Uuid, interval: Duration) -> Result<()> {
    let mut seen: Vec<StageStatus> = Vec::new();

    loop {
        let run = client.get_run(run_id).await?;

        for (index, stage) in run.stages.iter().enumerate() {
            if seen.get(index) == Some(&stage.status) {
                continue;
            }
            if stage.status != StageStatus::Pending {
                println!(
                    "  {} {:<12} {}",
                    "▸".cyan(),
                    stage.name,
                    colorize_stage(&stage.status)
                );
            }
        }
        seen = run.stages.iter().map(|stage| stage.status).collect();

        if run.status.is_terminal() {
            println!();
            print_outcome(&run);
            return Ok(());
        }

        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Formatting
// =============================================================================

fn print_run_summary(run: &RunSummary) {
    println!(
        "  {} #{} {} {}",
        "▸".cyan(),
        run.sequence,
        run.commit,
        run.id.to_string().dimmed()
    );
    println!("    Status:   {}", colorize_status(&run.status));
    if let Some(stage) = &run.current_stage {
        println!("    Stage:    {}", stage);
    }
    println!(
        "    Created:  {}",
        run.requested_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_run_details(run: &Run) {
    println!("{}", "Run Details:".bold());
    println!("  ID:        {}", run.id.to_string().cyan());
    println!("  Sequence:  #{}", run.sequence);
    println!("  Pipeline:  {}", run.pipeline);
    println!("  Commit:    {}", run.commit);
    println!("  Trigger:   {:?}", run.trigger);
    println!("  Status:    {}", colorize_status(&run.status));
    println!(
        "  Requested: {}",
        run.requested_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(started) = run.started_at {
        println!("  Started:   {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));

        if let Some(started) = run.started_at {
            let duration = completed.signed_duration_since(started);
            println!("  Duration:  {}s", duration.num_seconds());
        }
    }

    println!("\n{}", "Stages:".bold());
    for stage in &run.stages {
        print!("  {:<12} {}", stage.name, colorize_stage(&stage.status));
        if let Some(artifact) = &stage.artifact {
            print!("  → {}", artifact.dimmed());
        }
        println!();
        if let Some(failure) = &stage.failure {
            println!("    {} {}", failure.kind.to_string().red(), failure.message);
        }
    }

    if run.outcome.is_some() {
        println!();
        print_outcome(run);
    }
}

fn print_outcome(run: &Run) {
    match &run.outcome {
        Some(RunOutcome::Succeeded) => {
            println!("{} Run #{} succeeded", "✓".green(), run.sequence);
        }
        Some(RunOutcome::Failed {
            stage_name,
            kind,
            message,
            ..
        }) => {
            println!(
                "{} Run #{} failed in {} ({})",
                "✗".red(),
                run.sequence,
                stage_name,
                kind
            );
            println!("  {}", message.red());
        }
        None => println!("Run #{} is {}", run.sequence, colorize_status(&run.status)),
    }
}

fn colorize_status(status: &RunStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        RunStatus::Queued => status_str.yellow(),
        RunStatus::Running => status_str.cyan(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Cancelled => status_str.dimmed(),
    }
}

fn colorize_stage(status: &StageStatus) -> ColoredString {
    let status_str = format!("{:?}", status);
    match status {
        StageStatus::Pending | StageStatus::Skipped => status_str.dimmed(),
        StageStatus::Running => status_str.cyan(),
        StageStatus::Succeeded => status_str.green(),
        StageStatus::Failed => status_str.red(),
        StageStatus::Cancelled => status_str.yellow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_filter_maps_to_run_status() {
        assert_eq!(RunStatus::from(StatusFilter::Failed), RunStatus::Failed);
        assert_eq!(RunStatus::from(StatusFilter::Queued), RunStatus::Queued);
    }
}
