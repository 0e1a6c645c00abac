//! Table output formatting for CLI commands
//!
//! Renders agents, task counts and wave runs with comfy-table. Colors are
//! dropped when `NO_COLOR` is set or the terminal is dumb.

use chrono::{DateTime, Utc};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use std::collections::BTreeMap;
use std::env;

use crate::domain::models::{Agent, AgentStatus, TaskStatus, WaveRun, WaveRunStatus};

/// Table formatter for CLI output
pub struct TableFormatter {
    use_colors: bool,
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl TableFormatter {
    /// Colors follow the terminal (`NO_COLOR`, `TERM=dumb`).
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
        }
    }

    /// Force colors on or off.
    pub const fn with_colors(use_colors: bool) -> Self {
        Self { use_colors }
    }

    /// Agents with their status, current task and last heartbeat age.
    pub fn format_agents(&self, agents: &[Agent], now: DateTime<Utc>) -> String {
        let mut table = create_base_table();
        table.set_header(header(&["ID", "Type", "Status", "Task", "Last Seen"]));

        for agent in agents {
            let status = if self.use_colors {
                Cell::new(agent.status).fg(agent_status_color(agent.status))
            } else {
                Cell::new(agent.status)
            };
            let task = agent
                .current_task_id
                .map_or_else(|| "-".to_string(), |id| short_id(&id.to_string()));
            let last_seen = agent
                .last_heartbeat
                .map_or_else(|| "never".to_string(), |at| format_age(now - at));

            table.add_row(vec![
                Cell::new(short_id(&agent.id.to_string())),
                Cell::new(&agent.agent_type),
                status,
                Cell::new(task),
                Cell::new(last_seen),
            ]);
        }

        table.to_string()
    }

    /// One row per task status.
    pub fn format_task_counts(&self, counts: &BTreeMap<TaskStatus, usize>) -> String {
        let mut table = create_base_table();
        table.set_header(header(&["Status", "Tasks"]));

        for (status, count) in counts {
            let status_cell = if self.use_colors {
                Cell::new(status).fg(task_status_color(*status))
            } else {
                Cell::new(status)
            };
            table.add_row(vec![status_cell, Cell::new(count)]);
        }

        table.to_string()
    }

    /// Wave runs with their progress.
    pub fn format_wave_runs(&self, runs: &[WaveRun]) -> String {
        let mut table = create_base_table();
        table.set_header(header(&["Run", "Task List", "Wave", "Status"]));

        for run in runs {
            let status = if self.use_colors && run.status == WaveRunStatus::Completed {
                Cell::new(run.status.as_str()).fg(Color::Green)
            } else {
                Cell::new(run.status.as_str())
            };
            table.add_row(vec![
                Cell::new(short_id(&run.id.to_string())),
                Cell::new(short_id(&run.task_list_id.to_string())),
                Cell::new(format!("{}/{}", run.current_wave, run.total_waves)),
                status,
            ]);
        }

        table.to_string()
    }
}

fn create_base_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).add_attribute(Attribute::Bold))
        .collect()
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

/// Check if terminal supports colors
fn supports_color() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    !matches!(env::var("TERM").as_deref(), Ok("dumb"))
}

const fn agent_status_color(status: AgentStatus) -> Color {
    match status {
        AgentStatus::Idle => Color::White,
        AgentStatus::Working => Color::Cyan,
        AgentStatus::Stuck => Color::Red,
    }
}

const fn task_status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Pending => Color::White,
        TaskStatus::InProgress => Color::Cyan,
        TaskStatus::PendingVerification => Color::Yellow,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Blocked => Color::Magenta,
        TaskStatus::Skipped => Color::DarkGrey,
    }
}
