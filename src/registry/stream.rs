use std::path::PathBuf;

use serde_json::json;
use tokio::sync::mpsc;

use crate::db::task_repo;
use crate::error::AppResult;
use crate::git;
use crate::models::now_ts;
use crate::models::task::{TaskState, WaitingInputType};
use crate::registry::{get_entry, persist_entry, publish_state, transition, TaskEntry};
use crate::state::AppState;
use crate::supervisor::process::{self, ProcessEvent};

/// Consumes one attempt's event stream until the channel closes, then reaps
/// the process. Events carry the attempt they belong to; anything arriving
/// after a respawn bumped the counter is dropped.
pub fn spawn_monitor(
    state: AppState,
    task_id: String,
    attempt: u32,
    mut events: mpsc::Receiver<ProcessEvent>,
) {
    tokio::spawn(async move {
        log::info!("[Registry:{task_id}] Monitoring attempt {attempt}");
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => {
                    log::info!("[Registry:{task_id}] Monitor stopping for shutdown");
                    return;
                }
                event = events.recv() => match event {
                    Some(ProcessEvent::Output(chunk)) => {
                        if let Err(e) = on_output(&state, &task_id, attempt, chunk).await {
                            log::error!("[Registry:{task_id}] Failed to handle output: {e}");
                        }
                    }
                    Some(ProcessEvent::WaitingInput(input_type)) => {
                        if let Err(e) = on_wait_marker(&state, &task_id, attempt, input_type).await {
                            log::error!("[Registry:{task_id}] Failed to handle wait marker: {e}");
                        }
                    }
                    None => {
                        on_stream_end(&state, &task_id, attempt).await;
                        return;
                    }
                }
            }
        }
    });
}

/// Buffers one output chunk, assigns it the next seq, persists it and fans it
/// out. The first chunk of an attempt also moves `starting` to `busy`.
async fn on_output(state: &AppState, task_id: &str, attempt: u32, chunk: String) -> AppResult<()> {
    let Ok(entry_arc) = get_entry(state, task_id).await else {
        // Destroyed while the chunk was in flight
        return Ok(());
    };
    let mut entry = entry_arc.lock().await;
    if entry.removed || entry.task.attempt != attempt {
        return Ok(());
    }

    let seq = entry.next_seq;
    entry.next_seq += 1;
    entry.history.push(chunk.clone());
    entry.task.last_activity = now_ts();

    if entry.task.state == TaskState::Starting {
        transition(state, &mut entry, TaskState::Busy, None).await?;
    }

    {
        let state_clone = state.clone();
        let id = task_id.to_string();
        let persisted = chunk.clone();
        match tokio::task::spawn_blocking(move || {
            task_repo::append_output(&state_clone, &id, seq, &persisted)
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("[Registry:{task_id}] Failed to persist chunk {seq}: {e}"),
            Err(e) => log::error!("[Registry:{task_id}] Chunk persist panicked: {e}"),
        }
    }

    state.hub.publish(
        "task:output",
        json!({ "taskId": task_id, "seq": seq, "chunk": chunk }),
    );
    Ok(())
}

async fn on_wait_marker(
    state: &AppState,
    task_id: &str,
    attempt: u32,
    input_type: WaitingInputType,
) -> AppResult<()> {
    let Ok(entry_arc) = get_entry(state, task_id).await else {
        return Ok(());
    };
    let mut entry = entry_arc.lock().await;
    if entry.removed || entry.task.attempt != attempt {
        return Ok(());
    }

    mark_waiting(state, &mut entry, input_type).await?;
    Ok(())
}

/// Shared by the stdout wait marker and the notification hook: pause the task
/// for input, or just update the kind if it is already paused.
async fn mark_waiting(
    state: &AppState,
    entry: &mut TaskEntry,
    input_type: WaitingInputType,
) -> AppResult<bool> {
    match entry.task.state {
        TaskState::Starting | TaskState::Busy => {
            transition(state, entry, TaskState::WaitingInput, Some(input_type)).await?;
            Ok(true)
        }
        TaskState::WaitingInput => {
            if entry.task.waiting_input_type != Some(input_type) {
                entry.task.set_state(TaskState::WaitingInput, Some(input_type));
                persist_entry(state, entry).await;
                publish_state(state, &entry.task);
            }
            Ok(true)
        }
        other => {
            log::debug!(
                "[Registry:{}] Wait signal in {other} ignored",
                entry.task.id
            );
            Ok(false)
        }
    }
}

/// The stream closed: the process wrote its last line. Reap it and settle the
/// final state, unless interrupt, destroy or a hook already did.
async fn on_stream_end(state: &AppState, task_id: &str, attempt: u32) {
    let reaped = process::reap(state, task_id, attempt).await;

    let Ok(entry_arc) = get_entry(state, task_id).await else {
        return;
    };
    let mut entry = entry_arc.lock().await;
    if entry.removed || entry.task.attempt != attempt {
        return;
    }

    match entry.task.state {
        TaskState::Exited | TaskState::Interrupted => return,
        TaskState::Disconnected => {
            // Died with nobody attached. Stays parked; the next select picks
            // between re-attach and respawn by probing liveness.
            log::info!("[Registry:{task_id}] Process ended while disconnected");
            return;
        }
        _ => {}
    }

    match reaped {
        None => {
            // Interrupt or destroy took the process first; they own the state.
            log::debug!("[Registry:{task_id}] Stream ended after process was taken elsewhere");
        }
        Some(Ok(code)) => {
            log::info!("[Registry:{task_id}] Process exited with code {code:?}");
            match code {
                Some(0) => {}
                Some(code) => {
                    entry.task.error = Some(format!("Process exited with code {code}"));
                }
                None => {
                    entry.task.error = Some("Process was terminated by a signal".to_string());
                }
            }
            finish_git_capture(&mut entry).await;
            entry.task.pid = None;
            if let Err(e) = transition(state, &mut entry, TaskState::Exited, None).await {
                log::error!("[Registry:{task_id}] Failed to record exit: {e}");
            }
        }
        Some(Err(e)) => {
            log::warn!("[Registry:{task_id}] Lost the process: {e}");
            entry.stash_and_disconnect();
            persist_entry(state, &entry).await;
            publish_state(state, &entry.task);
        }
    }
}

/// Records the completion checkpoint on a task that started from a git
/// repository. Skipped when there was no starting checkpoint or one was
/// already taken for this task.
pub(crate) async fn finish_git_capture(entry: &mut TaskEntry) {
    let Some(before) = entry.task.git_state.clone() else {
        return;
    };
    if before.commit_after.is_some() {
        return;
    }

    let workspace = PathBuf::from(&entry.task.workspace_id);
    match tokio::task::spawn_blocking(move || git::capture_after(&workspace, &before)).await {
        Ok(Ok(after)) => entry.task.git_state = Some(after),
        Ok(Err(e)) => log::warn!(
            "[Registry:{}] Completion checkpoint failed: {e}",
            entry.task.id
        ),
        Err(e) => log::warn!(
            "[Registry:{}] Completion checkpoint panicked: {e}",
            entry.task.id
        ),
    }
}

/// Entry point for POST /api/claude-notification: the wrapper reports that
/// the process is paused for input. Unknown or stale sessions are dropped.
pub async fn on_notification_hook(
    state: &AppState,
    session_id: &str,
    notification_type: &str,
) -> bool {
    let Some((task_id, entry_arc)) = resolve_session(state, session_id).await else {
        return false;
    };
    let mut entry = entry_arc.lock().await;
    if entry.removed || entry.session_id.as_deref() != Some(session_id) {
        log::warn!("[Registry:{task_id}] Dropping notification for stale session {session_id}");
        return false;
    }

    let input_type = WaitingInputType::from_notification(notification_type);
    match mark_waiting(state, &mut entry, input_type).await {
        Ok(applied) => applied,
        Err(e) => {
            log::error!("[Registry:{task_id}] Failed to apply notification: {e}");
            false
        }
    }
}

/// Entry point for POST /api/claude-stopped: the wrapper reports that the
/// process finished. Usually beats stdout EOF, so the process is taken down
/// here and the monitor finds it already settled.
pub async fn on_stopped_hook(state: &AppState, session_id: &str) -> bool {
    let Some((task_id, entry_arc)) = resolve_session(state, session_id).await else {
        return false;
    };
    let mut entry = entry_arc.lock().await;
    if entry.removed || entry.session_id.as_deref() != Some(session_id) {
        log::warn!("[Registry:{task_id}] Dropping stop report for stale session {session_id}");
        return false;
    }

    match entry.task.state {
        TaskState::Exited | TaskState::Interrupted => true,
        TaskState::Starting | TaskState::Busy | TaskState::WaitingInput => {
            if let Err(e) = process::kill_task_process(state, &task_id, None).await {
                log::warn!("[Registry:{task_id}] Cleanup kill after stop report failed: {e}");
            }
            finish_git_capture(&mut entry).await;
            entry.task.pid = None;
            match transition(state, &mut entry, TaskState::Exited, None).await {
                Ok(()) => true,
                Err(e) => {
                    log::error!("[Registry:{task_id}] Failed to record stop report: {e}");
                    false
                }
            }
        }
        other => {
            log::debug!("[Registry:{task_id}] Stop report in {other} ignored");
            false
        }
    }
}

async fn resolve_session(
    state: &AppState,
    session_id: &str,
) -> Option<(String, std::sync::Arc<tokio::sync::Mutex<TaskEntry>>)> {
    let task_id = {
        let index = state.session_index.lock().await;
        index.get(session_id).cloned()
    };
    let Some(task_id) = task_id else {
        log::warn!("[Registry] Dropping hook for unknown session {session_id}");
        return None;
    };
    match get_entry(state, &task_id).await {
        Ok(entry_arc) => Some((task_id, entry_arc)),
        Err(_) => {
            log::warn!("[Registry:{task_id}] Session {session_id} maps to a missing task");
            None
        }
    }
}
