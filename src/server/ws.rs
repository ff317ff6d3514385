use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use crate::db::workspace_repo;
use crate::error::{AppError, AppResult};
use crate::hub;
use crate::models::event::{ClientAction, Envelope};
use crate::models::task::CreateTaskRequest;
use crate::models::workspace::{CreateWorkspaceRequest, Workspace};
use crate::registry::{self, archive, lifecycle, reconnect};
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let observer_id = state.hub.next_observer_id();
    log::info!("[Ws:{observer_id}] Observer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                log::debug!("[Ws] Send failed, observer gone");
                break;
            }
        }
    });

    // Subscribe before snapshotting. Anything published in between shows up
    // both in the snapshot and on the channel; the cursors drop the
    // duplicated output chunks.
    let hub_rx = state.hub.subscribe();
    let cursors = send_init(&state, &outbound_tx).await;
    let forward_task = spawn_forwarder(
        state.clone(),
        observer_id,
        hub_rx,
        cursors,
        outbound_tx.clone(),
    );

    while let Some(received) = ws_rx.next().await {
        let text = match received {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                log::debug!("[Ws:{observer_id}] Close frame received");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                log::warn!("[Ws:{observer_id}] Receive error: {e}");
                break;
            }
        };

        let action = match serde_json::from_str::<ClientAction>(&text) {
            Ok(action) => action,
            Err(e) => {
                log::warn!("[Ws:{observer_id}] Unparseable action: {e}");
                let error = AppError::InvalidRequest(format!("Unparseable action: {e}"));
                send_envelope(&outbound_tx, &Envelope::new("error", error.to_event_payload()))
                    .await;
                continue;
            }
        };

        dispatch(&state, observer_id, action, &outbound_tx).await;
    }

    log::info!("[Ws:{observer_id}] Observer disconnected");
    reconnect::observer_disconnected(&state, observer_id).await;
    forward_task.abort();
    send_task.abort();
}

/// Forwards hub events to one observer. An observer that cannot keep up gets
/// a fresh snapshot instead of an attempt to replay what the ring buffer
/// already dropped.
fn spawn_forwarder(
    state: AppState,
    observer_id: u64,
    mut hub_rx: broadcast::Receiver<Envelope>,
    mut cursors: HashMap<String, u64>,
    tx: mpsc::Sender<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match hub_rx.recv().await {
                Ok(envelope) => {
                    if !hub::should_forward(&envelope, &cursors) {
                        continue;
                    }
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("[Ws:{observer_id}] Failed to serialize event: {e}");
                            continue;
                        }
                    };
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[Ws:{observer_id}] Lagged {skipped} events, resyncing");
                    cursors = send_init(&state, &tx).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Sends the `init` envelope and returns per-task output cursors: a
/// `task:output` event with a seq at or below its cursor is already inside
/// the snapshot the observer just received.
async fn send_init(state: &AppState, tx: &mpsc::Sender<Message>) -> HashMap<String, u64> {
    let tasks = registry::task_snapshots(state).await;
    let workspaces = list_workspaces(state).await.unwrap_or_else(|e| {
        log::error!("[Ws] Failed to list workspaces for init: {e}");
        Vec::new()
    });
    let archived = archive::list_archived(state).await.unwrap_or_else(|e| {
        log::error!("[Ws] Failed to list archive for init: {e}");
        Vec::new()
    });
    let cli = state.cli_status.lock().await.clone();

    let cursors: HashMap<String, u64> = tasks
        .iter()
        .map(|snapshot| (snapshot.task.id.clone(), snapshot.output_seq))
        .collect();

    let envelope = Envelope::new(
        "init",
        json!({
            "tasks": tasks,
            "workspaces": workspaces,
            "archived": archived,
            "cli": cli,
        }),
    );
    send_envelope(tx, &envelope).await;
    cursors
}

async fn send_envelope(tx: &mpsc::Sender<Message>, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into())).await;
        }
        Err(e) => log::error!("[Ws] Failed to serialize {} envelope: {e}", envelope.event),
    }
}

async fn dispatch(
    state: &AppState,
    observer_id: u64,
    action: ClientAction,
    tx: &mpsc::Sender<Message>,
) {
    let kind = action.kind();
    log::debug!("[Ws:{observer_id}] Handling {kind}");

    let reply: AppResult<Option<Envelope>> = match action {
        ClientAction::TaskCreate {
            workspace_id,
            prompt,
            system_prompt,
        } => {
            let req = CreateTaskRequest {
                workspace_id,
                prompt,
                system_prompt,
            };
            lifecycle::create_task(state, req, Some(observer_id))
                .await
                .map(|_| None)
        }
        ClientAction::TaskSelect { task_id } => {
            reconnect::select_task(state, &task_id, observer_id)
                .await
                .map(|snapshot| Some(Envelope::new("task:selected", json!(snapshot))))
        }
        ClientAction::TaskInput { task_id, text } => lifecycle::send_input(state, &task_id, &text)
            .await
            .map(|_| None),
        ClientAction::TaskInterrupt { task_id } => {
            lifecycle::interrupt(state, &task_id).await.map(|_| None)
        }
        ClientAction::TaskArchive { task_id } => {
            archive::archive_task(state, &task_id).await.map(|_| None)
        }
        ClientAction::TaskDestroy { task_id } => {
            lifecycle::destroy_task(state, &task_id).await.map(|_| None)
        }
        ClientAction::TaskRevert { task_id } => {
            lifecycle::revert_task(state, &task_id).await.map(|_| None)
        }
        ClientAction::WorkspaceCreate { path, name } => {
            create_workspace(state, CreateWorkspaceRequest { path, name })
                .await
                .map(|_| None)
        }
        ClientAction::WorkspaceDelete { workspace_id } => {
            delete_workspace(state, &workspace_id).await.map(|_| None)
        }
        ClientAction::ArchiveRestore { task_id } => {
            archive::restore_task(state, &task_id).await.map(|_| None)
        }
        ClientAction::ArchiveContinue { task_id } => {
            archive::continue_task(state, &task_id).await.map(|_| None)
        }
        ClientAction::ArchiveDelete { task_id } => {
            archive::delete_archived(state, &task_id).await.map(|_| None)
        }
    };

    match reply {
        Ok(Some(envelope)) => send_envelope(tx, &envelope).await,
        Ok(None) => {}
        Err(e) => {
            log::warn!("[Ws:{observer_id}] {kind} failed: {e}");
            send_envelope(tx, &Envelope::new("error", e.to_event_payload())).await;
        }
    }
}

async fn list_workspaces(state: &AppState) -> AppResult<Vec<Workspace>> {
    let state_clone = state.clone();
    tokio::task::spawn_blocking(move || workspace_repo::list_workspaces(&state_clone))
        .await
        .map_err(|e| AppError::Internal(format!("Workspace list panicked: {e}")))?
}

async fn create_workspace(state: &AppState, req: CreateWorkspaceRequest) -> AppResult<Workspace> {
    let created = {
        let state_clone = state.clone();
        tokio::task::spawn_blocking(move || workspace_repo::create_workspace(&state_clone, req))
            .await
            .map_err(|e| AppError::Internal(format!("Workspace create panicked: {e}")))??
    };
    log::info!("[Ws] Workspace registered: {}", created.id);
    state
        .hub
        .publish("workspace:created", json!({ "workspace": &created }));
    Ok(created)
}

async fn delete_workspace(state: &AppState, workspace_id: &str) -> AppResult<()> {
    {
        let state_clone = state.clone();
        let id = workspace_id.to_string();
        tokio::task::spawn_blocking(move || workspace_repo::delete_workspace(&state_clone, &id))
            .await
            .map_err(|e| AppError::Internal(format!("Workspace delete panicked: {e}")))??;
    }
    log::info!("[Ws] Workspace removed: {workspace_id}");
    state
        .hub
        .publish("workspace:deleted", json!({ "workspaceId": workspace_id }));
    Ok(())
}
