use std::collections::HashMap;

use crate::orchestrator::PushProgress;

const FULL_BAR: &str = "[==================================================>]";
const EMPTY_BAR: &str = "[                                                  ]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LayerRow {
    id: String,
    progress: String,
    status: String,
}

/// Collapses a registry push stream into one row per layer.
///
/// Repeated events for the same layer overwrite its row, so the rendered
/// table has a fixed height no matter how many progress events arrive.
#[derive(Debug, Default)]
pub struct PushProgressTable {
    rows: Vec<LayerRow>,
    index: HashMap<String, usize>,
}

impl PushProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Returns whether the rendered table changed.
    pub fn record(&mut self, event: &PushProgress) -> bool {
        let Some(id) = event.id.as_deref().filter(|id| !id.is_empty()) else {
            return false;
        };
        let status = event.status.as_deref().unwrap_or("unknown");
        if status.contains("digest") || status.contains("Mounted") {
            return false;
        }
        let row = match self.index.get(id) {
            Some(&line) => line,
            None => {
                self.rows.push(LayerRow {
                    id: id.to_string(),
                    ..Default::default()
                });
                self.index.insert(id.to_string(), self.rows.len() - 1);
                self.rows.len() - 1
            }
        };
        let progress = match status {
            "Pushed" | "Layer already exists" => FULL_BAR.to_string(),
            "Preparing" | "Waiting" => EMPTY_BAR.to_string(),
            _ => match event.progress.as_deref() {
                Some("") => FULL_BAR.to_string(),
                Some(progress) => progress.to_string(),
                None => String::new(),
            },
        };
        let updated = LayerRow {
            id: id.to_string(),
            progress,
            status: status.to_string(),
        };
        let changed = self.rows[row] != updated;
        self.rows[row] = updated;
        changed
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn render(&self) -> String {
        self.rows
            .iter()
            .map(|row| format!("{} {} {}", row.id, row.progress, row.status))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
