use serde::{Deserialize, Serialize};

use super::task::Task;

/// A task snapshot plus its full output history, stored outside the live
/// registry and keyed by the original task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedTask {
    pub task: Task,
    pub history: Vec<String>,
    pub archived_at: String,
}
