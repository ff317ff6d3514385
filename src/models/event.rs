use serde::{Deserialize, Serialize};

/// Outbound message envelope. Every event delivered to an observer is
/// `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(event: &str, payload: serde_json::Value) -> Envelope {
        Envelope {
            event: event.to_string(),
            payload,
        }
    }
}

/// Inbound client actions, same `{"type", "payload"}` framing.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientAction {
    #[serde(rename = "task:create", rename_all = "camelCase")]
    TaskCreate {
        workspace_id: String,
        prompt: String,
        #[serde(default)]
        system_prompt: Option<String>,
    },
    #[serde(rename = "task:select", rename_all = "camelCase")]
    TaskSelect { task_id: String },
    #[serde(rename = "task:input", rename_all = "camelCase")]
    TaskInput { task_id: String, text: String },
    #[serde(rename = "task:interrupt", rename_all = "camelCase")]
    TaskInterrupt { task_id: String },
    #[serde(rename = "task:archive", rename_all = "camelCase")]
    TaskArchive { task_id: String },
    #[serde(rename = "task:destroy", rename_all = "camelCase")]
    TaskDestroy { task_id: String },
    #[serde(rename = "task:revert", rename_all = "camelCase")]
    TaskRevert { task_id: String },
    #[serde(rename = "workspace:create", rename_all = "camelCase")]
    WorkspaceCreate {
        path: String,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename = "workspace:delete", rename_all = "camelCase")]
    WorkspaceDelete { workspace_id: String },
    #[serde(rename = "archive:restore", rename_all = "camelCase")]
    ArchiveRestore { task_id: String },
    #[serde(rename = "archive:continue", rename_all = "camelCase")]
    ArchiveContinue { task_id: String },
    #[serde(rename = "archive:delete", rename_all = "camelCase")]
    ArchiveDelete { task_id: String },
}

impl ClientAction {
    /// The wire name of the action, for logs and error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientAction::TaskCreate { .. } => "task:create",
            ClientAction::TaskSelect { .. } => "task:select",
            ClientAction::TaskInput { .. } => "task:input",
            ClientAction::TaskInterrupt { .. } => "task:interrupt",
            ClientAction::TaskArchive { .. } => "task:archive",
            ClientAction::TaskDestroy { .. } => "task:destroy",
            ClientAction::TaskRevert { .. } => "task:revert",
            ClientAction::WorkspaceCreate { .. } => "workspace:create",
            ClientAction::WorkspaceDelete { .. } => "workspace:delete",
            ClientAction::ArchiveRestore { .. } => "archive:restore",
            ClientAction::ArchiveContinue { .. } => "archive:continue",
            ClientAction::ArchiveDelete { .. } => "archive:delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_type_payload_framing() {
        let envelope = Envelope::new("task:output", json!({"taskId": "t1", "seq": 3}));
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "task:output");
        assert_eq!(value["payload"]["seq"], 3);
    }

    #[test]
    fn client_actions_parse_colon_names() {
        let raw = r#"{"type":"task:input","payload":{"taskId":"abc","text":"yes"}}"#;
        match serde_json::from_str::<ClientAction>(raw).expect("parse") {
            ClientAction::TaskInput { task_id, text } => {
                assert_eq!(task_id, "abc");
                assert_eq!(text, "yes");
            }
            other => panic!("unexpected action {other:?}"),
        }

        let raw = r#"{"type":"task:create","payload":{"workspaceId":"/w","prompt":"p"}}"#;
        match serde_json::from_str::<ClientAction>(raw).expect("parse") {
            ClientAction::TaskCreate {
                workspace_id,
                prompt,
                system_prompt,
            } => {
                assert_eq!(workspace_id, "/w");
                assert_eq!(prompt, "p");
                assert!(system_prompt.is_none());
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn unknown_action_type_is_an_error() {
        let raw = r#"{"type":"task:unknown","payload":{}}"#;
        assert!(serde_json::from_str::<ClientAction>(raw).is_err());
    }
}
