use serde::{Deserialize, Serialize};

/// Lifecycle states of a task. Legal transitions are encoded in
/// [`TaskState::can_transition`]; everything else is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Starting,
    Busy,
    WaitingInput,
    Disconnected,
    Interrupted,
    Exited,
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Starting => "starting",
            TaskState::Busy => "busy",
            TaskState::WaitingInput => "waiting_input",
            TaskState::Disconnected => "disconnected",
            TaskState::Interrupted => "interrupted",
            TaskState::Exited => "exited",
            TaskState::Archived => "archived",
        }
    }

    pub fn from_str(raw: &str) -> Option<TaskState> {
        match raw {
            "idle" => Some(TaskState::Idle),
            "starting" => Some(TaskState::Starting),
            "busy" => Some(TaskState::Busy),
            "waiting_input" => Some(TaskState::WaitingInput),
            "disconnected" => Some(TaskState::Disconnected),
            "interrupted" => Some(TaskState::Interrupted),
            "exited" => Some(TaskState::Exited),
            "archived" => Some(TaskState::Archived),
            _ => None,
        }
    }

    /// States with a (potentially) live backing process.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            TaskState::Starting | TaskState::Busy | TaskState::WaitingInput
        )
    }

    /// States from which a task may move to the archive store.
    pub fn can_archive(&self) -> bool {
        matches!(
            self,
            TaskState::Exited | TaskState::Interrupted | TaskState::Disconnected
        )
    }

    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Idle, Starting) => true,
            (Starting, Busy) => true,
            // A wait marker or notification hook can land before the first
            // plain output line.
            (Starting, WaitingInput) => true,
            (Starting, Exited) => true,
            (Busy, WaitingInput) => true,
            (WaitingInput, Busy) => true,
            (Busy, Exited) | (WaitingInput, Exited) => true,
            (Busy, Interrupted) | (WaitingInput, Interrupted) => true,
            (Idle, Disconnected)
            | (Starting, Disconnected)
            | (Busy, Disconnected)
            | (WaitingInput, Disconnected) => true,
            (Disconnected, Starting) | (Disconnected, Busy) | (Disconnected, WaitingInput) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of input a paused task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitingInputType {
    Permission,
    Question,
    Idle,
}

impl WaitingInputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitingInputType::Permission => "permission",
            WaitingInputType::Question => "question",
            WaitingInputType::Idle => "idle",
        }
    }

    pub fn from_str(raw: &str) -> Option<WaitingInputType> {
        match raw {
            "permission" => Some(WaitingInputType::Permission),
            "question" => Some(WaitingInputType::Question),
            "idle" => Some(WaitingInputType::Idle),
            _ => None,
        }
    }

    /// Folds a notification hook's free-form `notification_type` into the
    /// closed enum.
    pub fn from_notification(raw: &str) -> WaitingInputType {
        let lower = raw.to_lowercase();
        if lower.contains("permission") {
            WaitingInputType::Permission
        } else if lower.contains("idle") {
            WaitingInputType::Idle
        } else {
            WaitingInputType::Question
        }
    }
}

/// Git checkpoint bracketing one task: the commit it started from and, once
/// it completed, what it touched and whether a hard revert is still safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGitState {
    pub commit_before: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_after: Option<String>,
    pub uncommitted_before: bool,
    #[serde(default)]
    pub files_modified: Vec<String>,
    pub can_revert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_input_type: Option<WaitingInputType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_state: Option<TaskGitState>,
    /// Set when a spawn failure moved the task to `exited`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub attempt: u32,
    pub created_at: String,
    pub last_activity: String,
}

impl Task {
    pub fn new(workspace_id: &str, prompt: &str, system_prompt: Option<String>) -> Task {
        let now = super::now_ts();
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            prompt: prompt.to_string(),
            system_prompt,
            state: TaskState::Idle,
            waiting_input_type: None,
            git_state: None,
            error: None,
            pid: None,
            attempt: 0,
            created_at: now.clone(),
            last_activity: now,
        }
    }

    /// The single mutation point for task state. Keeps `waiting_input_type`
    /// populated exactly while the state is `waiting_input` and bumps
    /// `last_activity`.
    pub fn set_state(&mut self, state: TaskState, waiting: Option<WaitingInputType>) {
        self.state = state;
        self.waiting_input_type = if state == TaskState::WaitingInput {
            Some(waiting.unwrap_or(WaitingInputType::Question))
        } else {
            None
        };
        self.last_activity = super::now_ts();
    }
}

/// Wire shape of a task inside the `init` snapshot: the record plus its
/// buffered output and the seq of the last chunk included.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub task: Task,
    pub history: Vec<String>,
    pub output_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub workspace_id: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_input_type_follows_state() {
        let mut task = Task::new("/tmp/ws", "count to 5", None);
        task.set_state(TaskState::Starting, None);
        assert!(task.waiting_input_type.is_none());

        task.set_state(TaskState::Busy, None);
        task.set_state(TaskState::WaitingInput, Some(WaitingInputType::Permission));
        assert_eq!(task.waiting_input_type, Some(WaitingInputType::Permission));

        // Entering waiting_input without an explicit type still sets one
        task.set_state(TaskState::Busy, None);
        task.set_state(TaskState::WaitingInput, None);
        assert_eq!(task.waiting_input_type, Some(WaitingInputType::Question));

        // Leaving waiting_input always clears it, even if a type is passed
        task.set_state(TaskState::Busy, Some(WaitingInputType::Question));
        assert!(task.waiting_input_type.is_none());
    }

    #[test]
    fn transition_graph_matches_lifecycle() {
        use TaskState::*;
        let allowed = [
            (Idle, Starting),
            (Starting, Busy),
            (Starting, Exited),
            (Busy, WaitingInput),
            (WaitingInput, Busy),
            (Busy, Exited),
            (WaitingInput, Exited),
            (Busy, Interrupted),
            (WaitingInput, Interrupted),
            (Busy, Disconnected),
            (Starting, Disconnected),
            (WaitingInput, Disconnected),
            (Disconnected, Starting),
            (Disconnected, Busy),
            (Disconnected, WaitingInput),
        ];
        for (from, to) in allowed {
            assert!(from.can_transition(to), "{from} -> {to} should be legal");
        }

        let refused = [
            (Exited, Busy),
            (Interrupted, Busy),
            (Archived, Starting),
            (Exited, Disconnected),
            (Idle, Busy),
            (Busy, Starting),
        ];
        for (from, to) in refused {
            assert!(!from.can_transition(to), "{from} -> {to} should be refused");
        }
    }

    #[test]
    fn wire_names_are_camel_case() {
        let mut task = Task::new("/tmp/ws", "p", None);
        task.set_state(TaskState::WaitingInput, Some(WaitingInputType::Idle));
        let value = serde_json::to_value(&task).expect("serialize");
        assert_eq!(value["workspaceId"], "/tmp/ws");
        assert_eq!(value["waitingInputType"], "idle");
        assert!(value["lastActivity"].is_string());
        assert!(value.get("waiting_input_type").is_none());
    }

    #[test]
    fn notification_type_folding() {
        assert_eq!(
            WaitingInputType::from_notification("permission_request"),
            WaitingInputType::Permission
        );
        assert_eq!(
            WaitingInputType::from_notification("agent-idle"),
            WaitingInputType::Idle
        );
        assert_eq!(
            WaitingInputType::from_notification("anything else"),
            WaitingInputType::Question
        );
    }
}
