//! Long-running scheduler command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::cli::{build_runtime, init_logging, load_config};
use crate::services::{EventPayload, SchedulerEvent};

/// Arguments for `crown run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keep every loop running but dispatch no workers
    #[arg(long)]
    pub dry_run: bool,
}

/// Start both loops and stream events until Ctrl-C.
pub async fn execute(args: RunArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let _logger = init_logging(&config, json_mode)?;
    let runtime = build_runtime(&config).await?;

    if args.dry_run {
        runtime.controls().set_spawning_enabled(false);
    }

    if !json_mode {
        println!("Starting crown scheduler");
        println!("   Tick interval:  {}s", config.scheduler.tick_interval_secs);
        println!("   Crown interval: {}s", config.crown.interval_secs);
        println!("   Database:       {}", config.database.path);
        if args.dry_run {
            println!("   Mode: DRY RUN (spawning disabled)");
        }
        println!();
    }

    let mut events = runtime.events().subscribe();
    runtime.start().await?;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, json_mode),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    if !json_mode {
        println!("\nShutting down...");
    }
    runtime.stop().await?;
    Ok(())
}

/// JSON mode streams one event per line.
fn print_event(event: &SchedulerEvent, json_mode: bool) {
    if json_mode {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }
    println!(
        "{} {:<20} {}",
        event.timestamp.format("%H:%M:%S"),
        event.payload.kind(),
        describe(&event.payload)
    );
}

fn describe(payload: &EventPayload) -> String {
    match payload {
        EventPayload::TaskAssigned {
            display_id,
            agent_id,
            ..
        } => format!("{display_id} -> agent {agent_id}"),
        EventPayload::TaskCompleted {
            display_id,
            awaiting_verification,
            ..
        } => {
            if *awaiting_verification {
                format!("{display_id} (awaiting verification)")
            } else {
                display_id.clone()
            }
        }
        EventPayload::TaskFailed {
            display_id,
            error,
            retry_count,
            ..
        } => format!("{display_id} attempt {retry_count}: {error}"),
        EventPayload::RetryExhausted {
            display_id,
            retry_count,
            ..
        } => format!("{display_id} blocked after {retry_count} retries"),
        EventPayload::TaskBlocked {
            display_id, reason, ..
        } => format!("{display_id}: {reason}"),
        EventPayload::TickSummary {
            tick,
            working_agents,
            idle_agents,
            tasks_assigned,
        } => format!(
            "tick {tick}: {working_agents} working, {idle_agents} idle, {tasks_assigned} assigned"
        ),
        EventPayload::WaveStarted {
            wave, task_count, ..
        } => format!("wave {wave} ({task_count} tasks)"),
        EventPayload::WaveCompleted { total_waves, .. } => {
            format!("all {total_waves} waves done")
        }
        EventPayload::AgentError { agent_id, error } => format!("agent {agent_id}: {error}"),
        EventPayload::AgentRecovered {
            agent_id,
            requeued_task_id,
        } => match requeued_task_id {
            Some(task_id) => format!("agent {agent_id}, requeued {task_id}"),
            None => format!("agent {agent_id}"),
        },
        EventPayload::AgentStuckReset { agent_id, .. } => format!("agent {agent_id}"),
        EventPayload::DiagnosisDispatched { display_id, .. } => display_id.clone(),
    }
}
