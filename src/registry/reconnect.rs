use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::task_repo;
use crate::error::{AppError, AppResult};
use crate::models::task::{TaskSnapshot, TaskState};
use crate::registry::{
    get_entry, lifecycle, persist_entry, publish_state, transition, TaskEntry,
};
use crate::state::AppState;
use crate::supervisor::process;

/// Rebuilds the live registry from sqlite after a server start. Process
/// handles do not survive a restart, so anything that was running is parked
/// in `disconnected`; a later select decides whether to respawn it.
pub async fn reconcile_on_startup(state: &AppState) -> AppResult<()> {
    let entries = {
        let state_clone = state.clone();
        tokio::task::spawn_blocking(move || -> AppResult<Vec<TaskEntry>> {
            let records = task_repo::load_tasks(&state_clone)?;
            let mut entries = Vec::with_capacity(records.len());
            for record in records {
                let output = task_repo::load_output(&state_clone, &record.task.id)?;
                let mut entry = TaskEntry::from_record(record, output);
                if entry.task.state.has_process() {
                    entry.stash_and_disconnect();
                    entry.task.pid = None;
                    task_repo::update_task(&state_clone, &entry.record())?;
                    log::info!(
                        "[Registry:{}] Parked as disconnected after restart",
                        entry.task.id
                    );
                }
                entries.push(entry);
            }
            Ok(entries)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Startup reconcile panicked: {e}")))??
    };

    let mut sessions = state.session_index.lock().await;
    let mut tasks = state.tasks.lock().await;
    for entry in entries {
        if let Some(session) = &entry.session_id {
            sessions.insert(session.clone(), entry.task.id.clone());
        }
        tasks.insert(entry.task.id.clone(), Arc::new(Mutex::new(entry)));
    }
    log::info!("[Registry] Restored {} task(s) from disk", tasks.len());
    Ok(())
}

/// Attaches an observer to a task and returns the full snapshot for replay.
/// A disconnected task is brought back: re-attached in place when its
/// process is still alive, respawned with the original prompt when it is
/// not. Concurrent selects serialize on the entry lock, so only the first
/// one finds the task disconnected and only one respawn happens.
pub async fn select_task(
    state: &AppState,
    task_id: &str,
    observer_id: u64,
) -> AppResult<TaskSnapshot> {
    let entry_arc = get_entry(state, task_id).await?;
    let mut entry = entry_arc.lock().await;
    if entry.removed {
        return Err(AppError::NotFound(format!("Task {task_id} not found")));
    }

    entry.attached_observer = Some(observer_id);

    if entry.task.state == TaskState::Disconnected {
        if process::check_alive(state, task_id).await {
            // The process kept running and the monitor kept buffering; put
            // the task back where it was when the observer dropped.
            let to = entry.prior_state.take().unwrap_or(TaskState::Busy);
            let waiting = entry.prior_waiting.take();
            log::info!("[Registry:{task_id}] Re-attached to live process as {to}");
            transition(state, &mut entry, to, waiting).await?;
        } else {
            // Dead or gone. Reap any leftover handle, then start over with
            // the original prompt under a fresh session.
            if let Err(e) = process::kill_task_process(state, task_id, None).await {
                log::warn!("[Registry:{task_id}] Leftover process cleanup failed: {e}");
            }
            entry.prior_state = None;
            entry.prior_waiting = None;
            transition(state, &mut entry, TaskState::Starting, None).await?;
            lifecycle::spawn_attempt(state, &mut entry).await?;
        }
    } else {
        // Plain attach. Selecting counts as activity for the sweeper.
        entry.task.last_activity = crate::models::now_ts();
        persist_entry(state, &entry).await;
    }

    Ok(entry.snapshot())
}

/// Called when an observer's socket closes. Every task that observer was
/// driving moves to `disconnected`; the process keeps running and the
/// monitor keeps buffering output for the eventual re-attach.
pub async fn observer_disconnected(state: &AppState, observer_id: u64) {
    let entries: Vec<Arc<Mutex<TaskEntry>>> = {
        let tasks = state.tasks.lock().await;
        tasks.values().cloned().collect()
    };

    for entry_arc in entries {
        let mut entry = entry_arc.lock().await;
        if entry.removed || entry.attached_observer != Some(observer_id) {
            continue;
        }
        entry.attached_observer = None;

        if entry.task.state.has_process() {
            log::info!(
                "[Registry:{}] Observer {observer_id} dropped, task disconnected",
                entry.task.id
            );
            entry.stash_and_disconnect();
            persist_entry(state, &entry).await;
            publish_state(state, &entry.task);
        }
    }
}
