use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::registry::stream;
use crate::state::AppState;

/// Body of POST /api/claude-notification, sent by the wrapper's Notification
/// hook when the process pauses for input.
#[derive(Debug, Deserialize)]
pub struct NotificationHook {
    pub session_id: String,
    #[serde(default)]
    pub notification_type: Option<String>,
}

/// Body of POST /api/claude-stopped, sent by the wrapper's Stop hook.
#[derive(Debug, Deserialize)]
pub struct StoppedHook {
    pub session_id: String,
}

pub async fn claude_notification(
    State(state): State<AppState>,
    Json(hook): Json<NotificationHook>,
) -> Json<serde_json::Value> {
    log::debug!(
        "[Hooks] Notification for session {}: {:?}",
        hook.session_id,
        hook.notification_type
    );
    let notification_type = hook.notification_type.as_deref().unwrap_or("question");
    let applied =
        stream::on_notification_hook(&state, &hook.session_id, notification_type).await;
    Json(json!({ "ok": applied }))
}

pub async fn claude_stopped(
    State(state): State<AppState>,
    Json(hook): Json<StoppedHook>,
) -> Json<serde_json::Value> {
    log::debug!("[Hooks] Stop report for session {}", hook.session_id);
    let applied = stream::on_stopped_hook(&state, &hook.session_id).await;
    Json(json!({ "ok": applied }))
}
