use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::db::{archive_repo, workspace_repo};
use crate::error::{AppError, AppResult};
use crate::models::archive::ArchivedTask;
use crate::models::now_ts;
use crate::models::task::{Task, TaskState};
use crate::registry::{
    get_entry, lifecycle, publish_tasks_updated, transition, TaskEntry,
};
use crate::state::AppState;
use crate::supervisor::process;

/// Moves a finished (or disconnected) task out of the live registry into the
/// archive store, record and output history together.
pub async fn archive_task(state: &AppState, task_id: &str) -> AppResult<()> {
    let entry_arc = get_entry(state, task_id).await?;
    let mut entry = entry_arc.lock().await;
    if entry.removed {
        return Err(AppError::NotFound(format!("Task {task_id} not found")));
    }
    if !entry.task.state.can_archive() {
        return Err(AppError::InvalidState(format!(
            "Task {task_id} is {}, archive needs exited, interrupted or disconnected",
            entry.task.state
        )));
    }

    // A disconnected task may still own a live process. Archiving dismisses
    // the task, so the process goes with it.
    if let Err(e) = process::kill_task_process(state, task_id, None).await {
        log::warn!("[Registry:{task_id}] Kill during archive failed: {e}");
    }

    let mut snapshot = entry.task.clone();
    snapshot.state = TaskState::Archived;
    snapshot.waiting_input_type = None;
    snapshot.pid = None;
    let archived = ArchivedTask {
        task: snapshot,
        history: entry.history.clone(),
        archived_at: now_ts(),
    };

    {
        let state_clone = state.clone();
        tokio::task::spawn_blocking(move || archive_repo::move_to_archive(&state_clone, &archived))
            .await
            .map_err(|e| AppError::Internal(format!("Archive move panicked: {e}")))??;
    }

    entry.removed = true;
    if let Some(session) = entry.session_id.take() {
        state.session_index.lock().await.remove(&session);
    }
    state.tasks.lock().await.remove(task_id);
    drop(entry);

    log::info!("[Registry:{task_id}] Task archived");
    publish_archive_updated(state).await;
    publish_tasks_updated(state).await;
    Ok(())
}

/// Brings an archived task back as a live `idle` task with its history. No
/// process is spawned; `continue` is the variant that also starts one.
pub async fn restore_task(state: &AppState, archive_id: &str) -> AppResult<Task> {
    let entry_arc = restore_entry(state, archive_id).await?;
    let entry = entry_arc.lock().await;
    state
        .hub
        .publish("task:restore", json!({ "task": entry.snapshot() }));
    let task = entry.task.clone();
    drop(entry);

    publish_archive_updated(state).await;
    publish_tasks_updated(state).await;
    Ok(task)
}

/// Restores an archived task and immediately starts a fresh attempt with the
/// original prompt.
pub async fn continue_task(state: &AppState, archive_id: &str) -> AppResult<Task> {
    let entry_arc = restore_entry(state, archive_id).await?;
    let mut entry = entry_arc.lock().await;
    state
        .hub
        .publish("task:restore", json!({ "task": entry.snapshot() }));
    transition(state, &mut entry, TaskState::Starting, None).await?;
    lifecycle::spawn_attempt(state, &mut entry).await?;
    let task = entry.task.clone();
    drop(entry);

    publish_archive_updated(state).await;
    publish_tasks_updated(state).await;
    Ok(task)
}

pub async fn delete_archived(state: &AppState, archive_id: &str) -> AppResult<()> {
    {
        let state_clone = state.clone();
        let id = archive_id.to_string();
        tokio::task::spawn_blocking(move || archive_repo::delete_archived(&state_clone, &id))
            .await
            .map_err(|e| AppError::Internal(format!("Archive delete panicked: {e}")))??;
    }
    log::info!("[Archive:{archive_id}] Archived task deleted");
    publish_archive_updated(state).await;
    Ok(())
}

pub async fn list_archived(state: &AppState) -> AppResult<Vec<ArchivedTask>> {
    let state_clone = state.clone();
    tokio::task::spawn_blocking(move || archive_repo::list_archived(&state_clone))
        .await
        .map_err(|e| AppError::Internal(format!("Archive list panicked: {e}")))?
}

pub(crate) async fn publish_archive_updated(state: &AppState) {
    match list_archived(state).await {
        Ok(archived) => state
            .hub
            .publish("archive:updated", json!({ "archived": archived })),
        Err(e) => log::error!("[Archive] Failed to list archive for broadcast: {e}"),
    }
}

/// The common restore path: load the archive row, verify the workspace is
/// still registered, move the rows back and insert a fresh entry. The map
/// lock is held across the database move so a racing restore of the same id
/// cannot double-insert.
async fn restore_entry(state: &AppState, archive_id: &str) -> AppResult<Arc<Mutex<TaskEntry>>> {
    let archived = {
        let state_clone = state.clone();
        let id = archive_id.to_string();
        tokio::task::spawn_blocking(move || archive_repo::get_archived(&state_clone, &id))
            .await
            .map_err(|e| AppError::Internal(format!("Archive lookup panicked: {e}")))??
    };

    let workspace_id = archived.task.workspace_id.clone();
    let workspace_check = {
        let state_clone = state.clone();
        let id = workspace_id.clone();
        tokio::task::spawn_blocking(move || workspace_repo::get_workspace(&state_clone, &id))
            .await
            .map_err(|e| AppError::Internal(format!("Workspace lookup panicked: {e}")))?
    };
    if workspace_check.is_err() {
        return Err(AppError::Workspace(format!(
            "Workspace {workspace_id} is no longer registered"
        )));
    }

    let mut task = archived.task.clone();
    task.set_state(TaskState::Idle, None);
    task.pid = None;
    let task_id = task.id.clone();

    let mut tasks = state.tasks.lock().await;
    if tasks.contains_key(&task_id) {
        return Err(AppError::ArchiveIntegrity(format!(
            "Task {task_id} is already live"
        )));
    }

    {
        let state_clone = state.clone();
        let task_clone = task.clone();
        let history = archived.history.clone();
        tokio::task::spawn_blocking(move || {
            archive_repo::move_to_live(&state_clone, &task_clone, &history, None)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Archive restore panicked: {e}")))??;
    }

    let mut entry = TaskEntry::new(task);
    entry.history = archived.history;
    entry.next_seq = entry.history.len() as u64 + 1;
    let entry_arc = Arc::new(Mutex::new(entry));
    tasks.insert(task_id.clone(), entry_arc.clone());
    drop(tasks);

    log::info!("[Registry:{task_id}] Task restored from archive");
    Ok(entry_arc)
}
