//! Scheduler status command.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::cli::output::table::TableFormatter;
use crate::cli::output::{output, CommandOutput};
use crate::cli::{load_config, open_store};
use crate::domain::models::{Agent, AgentStatus, TaskStatus, WaveRun, WaveRunStatus};
use crate::domain::ports::{SchedulerStore, TaskFilter};

/// Snapshot of agents, tasks and open wave runs.
#[derive(Debug, Serialize)]
pub struct StatusOutput {
    /// All registered agents
    pub agents: Vec<Agent>,
    /// Number of tasks per status
    pub task_counts: BTreeMap<TaskStatus, usize>,
    /// Wave runs still running
    pub wave_runs: Vec<WaveRun>,
}

impl StatusOutput {
    /// Read the snapshot from `store`.
    pub async fn collect(store: &dyn SchedulerStore) -> Result<Self> {
        let agents = store.get_agents().await?;
        let tasks = store.get_tasks(TaskFilter::default()).await?;
        let mut task_counts = BTreeMap::new();
        for task in &tasks {
            *task_counts.entry(task.status).or_insert(0) += 1;
        }
        let wave_runs = store.get_wave_runs(Some(WaveRunStatus::Running)).await?;
        Ok(Self {
            agents,
            task_counts,
            wave_runs,
        })
    }

    fn count_agents(&self, status: AgentStatus) -> usize {
        self.agents.iter().filter(|a| a.status == status).count()
    }
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let formatter = TableFormatter::new();
        let mut sections = vec![format!(
            "Agents: {} working, {} idle, {} stuck",
            self.count_agents(AgentStatus::Working),
            self.count_agents(AgentStatus::Idle),
            self.count_agents(AgentStatus::Stuck),
        )];
        if !self.agents.is_empty() {
            sections.push(formatter.format_agents(&self.agents, Utc::now()));
        }

        if self.task_counts.is_empty() {
            sections.push("No tasks.".to_string());
        } else {
            sections.push(formatter.format_task_counts(&self.task_counts));
        }

        if !self.wave_runs.is_empty() {
            sections.push(format!("Running wave runs ({}):", self.wave_runs.len()));
            sections.push(formatter.format_wave_runs(&self.wave_runs));
        }
        sections.join("\n\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Print the scheduler status.
pub async fn execute(config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;
    let status = StatusOutput::collect(store.as_ref()).await?;
    output(&status, json_mode);
    Ok(())
}
