//! Single tick command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::Path;
use tokio::time::Duration;

use crate::cli::output::{optional_count, output, CommandOutput};
use crate::cli::{build_runtime, init_logging, load_config};
use crate::services::TickSummary;

/// Arguments for `crown tick`.
#[derive(Args, Debug)]
pub struct TickArgs {
    /// Run every phase but dispatch no workers
    #[arg(long)]
    pub dry_run: bool,

    /// Wait up to SECS for workers started by this tick to report back
    #[arg(long, value_name = "SECS")]
    pub wait: Option<u64>,
}

/// Result of one tick.
#[derive(Debug, Serialize)]
pub struct TickOutput {
    /// Phase results
    #[serde(flatten)]
    pub summary: TickSummary,
    /// Worker reports applied before exit
    pub reports_applied: usize,
}

impl CommandOutput for TickOutput {
    fn to_human(&self) -> String {
        let s = &self.summary;
        if s.paused {
            return "Scheduler is paused; tick skipped.".to_string();
        }
        let mut lines = vec![
            format!("Tick {} completed:", s.tick),
            format!("  Marked stuck:        {}", optional_count(s.marked_stuck)),
            format!("  Agents cleaned:      {}", optional_count(s.agents_cleaned)),
            format!("  Sessions terminated: {}", optional_count(s.sessions_terminated)),
            format!("  Waves advanced:      {}", optional_count(s.waves_advanced)),
            format!("  Tasks assigned:      {}", s.tasks_assigned),
            format!("  Working agents:      {}", s.working_agents),
            format!("  Idle agents:         {}", s.idle_agents),
        ];
        if self.reports_applied > 0 {
            lines.push(format!("  Reports applied:     {}", self.reports_applied));
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Run one tick, then apply whatever worker reports are available.
pub async fn execute(args: TickArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let _logger = init_logging(&config, json_mode)?;
    let runtime = build_runtime(&config).await?;

    if args.dry_run {
        runtime.controls().set_spawning_enabled(false);
    }

    let summary = runtime.tick_scheduler().tick().await;
    let reports_applied = match args.wait {
        Some(secs) if summary.tasks_assigned > 0 => {
            runtime
                .await_reports(summary.tasks_assigned, Duration::from_secs(secs))
                .await?
        }
        _ => runtime.drain_reports().await?,
    };

    output(
        &TickOutput {
            summary,
            reports_applied,
        },
        json_mode,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_tick_output() {
        let out = TickOutput {
            summary: TickSummary {
                paused: true,
                ..TickSummary::default()
            },
            reports_applied: 0,
        };
        assert!(out.to_human().contains("paused"));
        assert_eq!(out.to_json()["paused"], serde_json::json!(true));
    }

    #[test]
    fn test_skipped_phase_renders_dash() {
        let out = TickOutput {
            summary: TickSummary {
                tick: 4,
                marked_stuck: Some(1),
                tasks_assigned: 2,
                ..TickSummary::default()
            },
            reports_applied: 2,
        };
        let text = out.to_human();
        assert!(text.contains("Tick 4 completed"));
        assert!(text.contains("Waves advanced:      -"));
        assert!(text.contains("Reports applied:     2"));
        assert_eq!(out.to_json()["tasks_assigned"], serde_json::json!(2));
    }
}
