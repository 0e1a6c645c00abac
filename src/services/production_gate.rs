//! Config-driven task exclusion.

use crate::domain::models::{SchedulerConfig, Task};
use crate::domain::ports::ProductionGate;

/// Excludes tasks by category or display-id prefix.
#[derive(Debug, Clone, Default)]
pub struct CategoryGate {
    categories: Vec<String>,
    prefixes: Vec<String>,
}

impl CategoryGate {
    /// Exclude the given categories (case-insensitive) and display-id prefixes.
    pub fn new(categories: Vec<String>, prefixes: Vec<String>) -> Self {
        Self {
            categories,
            prefixes,
        }
    }

    /// Gate from the `scheduler` config section.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.excluded_categories.clone(),
            config.excluded_display_id_prefixes.clone(),
        )
    }
}

impl ProductionGate for CategoryGate {
    fn is_excluded(&self, task: &Task) -> bool {
        self.categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&task.category))
            || self
                .prefixes
                .iter()
                .any(|p| task.display_id.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_and_prefix_exclusion() {
        let gate = CategoryGate::new(vec!["research".into()], vec!["SPIKE-".into()]);
        assert!(gate.is_excluded(&Task::new("TASK-1", "Research")));
        assert!(gate.is_excluded(&Task::new("SPIKE-4", "feature")));
        assert!(!gate.is_excluded(&Task::new("TASK-2", "feature")));
    }
}
