//! Effective configuration command.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::cli::load_config;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

/// Effective configuration after every source is merged.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ConfigOutput {
    /// Merged configuration
    pub config: Config,
}

impl CommandOutput for ConfigOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config)
            .unwrap_or_else(|e| format!("Failed to render configuration: {e}"))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

/// Print the effective configuration.
pub fn execute(config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path)?;
    output(&ConfigOutput { config }, json_mode);
    Ok(())
}
