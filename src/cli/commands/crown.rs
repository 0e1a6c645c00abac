//! Single supervisory pass command.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::Path;

use crate::cli::output::{output, CommandOutput};
use crate::cli::{build_runtime, init_logging, load_config};
use crate::services::CrownReport;

/// Arguments for `crown crown`.
#[derive(Args, Debug)]
pub struct CrownArgs {
    /// Do not dispatch a diagnostic worker after interventions
    #[arg(long)]
    pub no_diagnosis: bool,
}

/// Result of one crown pass.
#[derive(Debug, Serialize)]
pub struct CrownOutput {
    /// Counts from the pass
    #[serde(flatten)]
    pub report: CrownReport,
    /// Resets and blocks combined
    pub interventions: usize,
}

impl From<CrownReport> for CrownOutput {
    fn from(report: CrownReport) -> Self {
        Self {
            interventions: report.interventions(),
            report,
        }
    }
}

impl CommandOutput for CrownOutput {
    fn to_human(&self) -> String {
        let r = &self.report;
        let mut lines = vec![
            "Crown pass completed:".to_string(),
            format!("  Agents checked:      {}", r.agents_checked),
            format!("  Stuck agents reset:  {}", r.stuck_resets),
            format!("  Failing resets:      {}", r.failing_agent_resets),
            format!("  Exhausted blocked:   {}", r.exhausted_blocked),
            format!("  Orphans requeued:    {}", r.orphans_reset),
            format!("  Loops blocked:       {}", r.loops_blocked),
            format!("  Alerts sent:         {}", r.alerts),
        ];
        if let Some(task_id) = r.diagnosed_task {
            lines.push(format!("  Diagnosed task:      {task_id}"));
        }
        if self.interventions == 0 {
            lines.push("No interventions needed.".to_string());
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Run one supervisory pass and print what it did.
pub async fn execute(args: CrownArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    if args.no_diagnosis {
        config.crown.diagnosis_enabled = false;
    }
    let _logger = init_logging(&config, json_mode)?;
    let runtime = build_runtime(&config).await?;

    let report = runtime
        .crown_monitor()
        .pass()
        .await
        .context("Crown pass failed")?;

    output(&CrownOutput::from(report), json_mode);
    Ok(())
}
