use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{task_repo, workspace_repo};
use crate::error::{AppError, AppResult};
use crate::git;
use crate::models::now_ts;
use crate::models::task::{CreateTaskRequest, Task, TaskState};
use crate::registry::{
    get_entry, persist_entry, publish_state, publish_tasks_updated, stream, transition, TaskEntry,
};
use crate::state::AppState;
use crate::supervisor::process;

/// Creates a task in a registered workspace and launches its first attempt.
/// A spawn failure does not fail the call: the task lands in `exited` with
/// the error recorded on the record.
pub async fn create_task(
    state: &AppState,
    req: CreateTaskRequest,
    observer_id: Option<u64>,
) -> AppResult<Task> {
    if req.prompt.trim().is_empty() {
        return Err(AppError::InvalidRequest("Task prompt must not be empty".into()));
    }
    if !state.cli_status.lock().await.installed {
        return Err(AppError::Spawn(
            "claude CLI is not installed or not on PATH".into(),
        ));
    }

    let workspace = {
        let state_clone = state.clone();
        let workspace_id = req.workspace_id.clone();
        tokio::task::spawn_blocking(move || workspace_repo::get_workspace(&state_clone, &workspace_id))
            .await
            .map_err(|e| AppError::Internal(format!("Workspace lookup panicked: {e}")))??
    };

    let mut task = Task::new(&workspace.id, &req.prompt, req.system_prompt.clone());

    // Checkpoint the tree before the process can touch it. A workspace that
    // is not a git repository simply runs without revert support.
    let capture_path = PathBuf::from(&workspace.id);
    match tokio::task::spawn_blocking(move || git::capture_before(&capture_path)).await {
        Ok(Ok(git_state)) => task.git_state = Some(git_state),
        Ok(Err(e)) => log::warn!(
            "[Registry:{}] No git checkpoint for {}: {e}",
            task.id,
            workspace.id
        ),
        Err(e) => log::warn!("[Registry:{}] Git capture panicked: {e}", task.id),
    }

    task.set_state(TaskState::Starting, None);

    let entry_arc = Arc::new(Mutex::new(TaskEntry::new(task)));
    // Lock before publishing the Arc so nothing races the spawn below.
    let mut entry = entry_arc.lock().await;
    entry.attached_observer = observer_id;
    let task_id = entry.task.id.clone();
    state
        .tasks
        .lock()
        .await
        .insert(task_id.clone(), entry_arc.clone());

    let record = entry.record();
    let insert = {
        let state_clone = state.clone();
        tokio::task::spawn_blocking(move || task_repo::insert_task(&state_clone, &record))
            .await
            .map_err(|e| AppError::Internal(format!("Task insert panicked: {e}")))?
    };
    if let Err(e) = insert {
        entry.removed = true;
        state.tasks.lock().await.remove(&task_id);
        return Err(e);
    }

    state
        .hub
        .publish("task:created", json!({ "task": &entry.task }));

    spawn_attempt(state, &mut entry).await?;
    let created = entry.task.clone();
    drop(entry);

    publish_tasks_updated(state).await;
    Ok(created)
}

/// Launches one process attempt for the entry: fresh session id, spawn,
/// register, monitor, prompt down stdin. Caller holds the entry lock and has
/// already moved the task to `starting`. On spawn failure the task moves to
/// `exited` with the error recorded and the call still returns Ok.
pub(crate) async fn spawn_attempt(state: &AppState, entry: &mut TaskEntry) -> AppResult<()> {
    let session_id = Uuid::new_v4().to_string();
    entry.task.attempt += 1;
    let attempt = entry.task.attempt;
    let task_id = entry.task.id.clone();

    // Retire the previous session so late hooks from a dead attempt cannot
    // steer the task.
    if let Some(old) = entry.session_id.take() {
        state.session_index.lock().await.remove(&old);
    }

    let mut extra_env = HashMap::new();
    extra_env.insert("TASKDECK_SESSION_ID".to_string(), session_id.clone());
    extra_env.insert(
        "TASKDECK_HOOK_URL".to_string(),
        format!("http://{}/api", state.config.bind_addr),
    );
    if let Some(system_prompt) = &entry.task.system_prompt {
        extra_env.insert("TASKDECK_SYSTEM_PROMPT".to_string(), system_prompt.clone());
    }

    let spawned = process::spawn_task_process(
        &task_id,
        &session_id,
        attempt,
        &state.config.claude_bin,
        &state.config.claude_args,
        Path::new(&entry.task.workspace_id),
        &extra_env,
    )
    .await;

    match spawned {
        Ok((proc, events)) => {
            entry.task.pid = proc.pid;
            entry.task.error = None;
            entry.session_id = Some(session_id.clone());
            state
                .session_index
                .lock()
                .await
                .insert(session_id, task_id.clone());
            state.processes.lock().await.insert(task_id.clone(), proc);
            persist_entry(state, entry).await;

            stream::spawn_monitor(state.clone(), task_id.clone(), attempt, events);

            // The prompt goes down stdin as the first input line.
            if let Err(e) = process::write_input(state, &task_id, &entry.task.prompt).await {
                log::warn!("[Registry:{task_id}] Failed to write prompt: {e}");
            }
            Ok(())
        }
        Err(AppError::Spawn(message)) => {
            log::error!("[Registry:{task_id}] Attempt {attempt} failed to spawn: {message}");
            entry.task.error = Some(message.clone());
            entry.task.pid = None;
            transition(state, entry, TaskState::Exited, None).await?;
            state
                .hub
                .publish("error", AppError::Spawn(message).to_event_payload());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Forwards one line of input to a task that is waiting for it and moves it
/// back to `busy`. A broken pipe means the process is gone; the task is
/// parked in `disconnected` for the reconnect path to sort out.
pub async fn send_input(state: &AppState, task_id: &str, text: &str) -> AppResult<Task> {
    let entry_arc = get_entry(state, task_id).await?;
    let mut entry = entry_arc.lock().await;
    if entry.removed {
        return Err(AppError::NotFound(format!("Task {task_id} not found")));
    }
    if entry.task.state != TaskState::WaitingInput {
        return Err(AppError::InvalidState(format!(
            "Task {task_id} is {}, input needs waiting_input",
            entry.task.state
        )));
    }

    if let Err(e) = process::write_input(state, task_id, text).await {
        log::warn!("[Registry:{task_id}] Input write failed, marking disconnected: {e}");
        entry.stash_and_disconnect();
        persist_entry(state, &entry).await;
        publish_state(state, &entry.task);
        return Err(AppError::ProcessLost(format!(
            "Task {task_id} lost its process: {e}"
        )));
    }

    transition(state, &mut entry, TaskState::Busy, None).await?;
    Ok(entry.task.clone())
}

/// Stops a running task. Grace first, kill on timeout. Interrupting a task
/// that already terminated is a no-op; interrupting one that never ran is an
/// invalid transition.
pub async fn interrupt(state: &AppState, task_id: &str) -> AppResult<Task> {
    let entry_arc = get_entry(state, task_id).await?;
    let mut entry = entry_arc.lock().await;
    if entry.removed {
        return Err(AppError::NotFound(format!("Task {task_id} not found")));
    }

    match entry.task.state {
        TaskState::Exited | TaskState::Interrupted => {
            log::debug!(
                "[Registry:{task_id}] Interrupt on {} task ignored",
                entry.task.state
            );
            Ok(entry.task.clone())
        }
        TaskState::Busy | TaskState::WaitingInput => {
            process::kill_task_process(state, task_id, Some(state.config.interrupt_grace)).await?;
            transition(state, &mut entry, TaskState::Interrupted, None).await?;
            Ok(entry.task.clone())
        }
        other => Err(AppError::InvalidState(format!(
            "Task {task_id} is {other}, interrupt needs busy or waiting_input"
        ))),
    }
}

/// Kills the process (if any) and removes the task from the live registry
/// and the database. Destroying an already-destroyed task is a no-op.
pub async fn destroy_task(state: &AppState, task_id: &str) -> AppResult<()> {
    let entry_arc = {
        let tasks = state.tasks.lock().await;
        tasks.get(task_id).cloned()
    };
    let Some(entry_arc) = entry_arc else {
        log::debug!("[Registry:{task_id}] Destroy on unknown task ignored");
        return Ok(());
    };

    let mut entry = entry_arc.lock().await;
    if entry.removed {
        return Ok(());
    }

    if let Err(e) = process::kill_task_process(state, task_id, None).await {
        log::warn!("[Registry:{task_id}] Kill during destroy failed: {e}");
    }

    entry.removed = true;
    if let Some(session) = entry.session_id.take() {
        state.session_index.lock().await.remove(&session);
    }
    state.tasks.lock().await.remove(task_id);
    drop(entry);

    let state_clone = state.clone();
    let id = task_id.to_string();
    match tokio::task::spawn_blocking(move || task_repo::delete_task(&state_clone, &id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("[Registry:{task_id}] Failed to delete task row: {e}"),
        Err(e) => log::error!("[Registry:{task_id}] Task delete panicked: {e}"),
    }

    log::info!("[Registry:{task_id}] Task destroyed");
    state.hub.publish("task:destroyed", json!({ "taskId": task_id }));
    publish_tasks_updated(state).await;
    Ok(())
}

/// Hard-resets the workspace to the task's completion checkpoint. All
/// preconditions live in [`git::revert`]; here we only refuse tasks whose
/// process could still be writing to the tree.
pub async fn revert_task(state: &AppState, task_id: &str) -> AppResult<Task> {
    let entry_arc = get_entry(state, task_id).await?;
    let mut entry = entry_arc.lock().await;
    if entry.removed {
        return Err(AppError::NotFound(format!("Task {task_id} not found")));
    }

    if entry.task.state.has_process() || entry.task.state == TaskState::Disconnected {
        return Err(AppError::RevertPrecondition(format!(
            "Task {task_id} is {}, revert needs a finished task",
            entry.task.state
        )));
    }

    let git_state = entry.task.git_state.clone().ok_or_else(|| {
        AppError::RevertPrecondition(format!("Task {task_id} has no git checkpoint"))
    })?;

    let workspace = PathBuf::from(&entry.task.workspace_id);
    let reverted = tokio::task::spawn_blocking(move || git::revert(&workspace, &git_state))
        .await
        .map_err(|e| AppError::Internal(format!("Revert panicked: {e}")))??;

    log::info!(
        "[Registry:{task_id}] Workspace reverted to {}",
        reverted.commit_before
    );
    entry.task.git_state = Some(reverted);
    entry.task.last_activity = now_ts();
    persist_entry(state, &entry).await;
    state
        .hub
        .publish("task:stateChanged", json!({ "task": &entry.task }));
    Ok(entry.task.clone())
}
