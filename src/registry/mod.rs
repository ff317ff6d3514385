use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::db::task_repo::{self, TaskRecord};
use crate::error::{AppError, AppResult};
use crate::models::task::{Task, TaskSnapshot, TaskState, WaitingInputType};
use crate::state::AppState;

pub mod archive;
pub mod lifecycle;
pub mod reconnect;
pub mod stream;

/// A live task plus the registry-internal bookkeeping that never leaves the
/// server: buffered output, the supervisor session, the stashed pre-disconnect
/// state and the controlling observer.
#[derive(Debug)]
pub struct TaskEntry {
    pub task: Task,
    pub history: Vec<String>,
    pub next_seq: u64,
    pub session_id: Option<String>,
    pub prior_state: Option<TaskState>,
    pub prior_waiting: Option<WaitingInputType>,
    pub attached_observer: Option<u64>,
    /// Set when the entry has been removed from the map; a racer that cloned
    /// the Arc before removal must not resurrect it.
    pub removed: bool,
}

impl TaskEntry {
    pub fn new(task: Task) -> TaskEntry {
        TaskEntry {
            task,
            history: Vec::new(),
            next_seq: 1,
            session_id: None,
            prior_state: None,
            prior_waiting: None,
            attached_observer: None,
            removed: false,
        }
    }

    pub fn from_record(record: TaskRecord, output: Vec<(u64, String)>) -> TaskEntry {
        let next_seq = output.last().map(|(seq, _)| seq + 1).unwrap_or(1);
        TaskEntry {
            task: record.task,
            history: output.into_iter().map(|(_, chunk)| chunk).collect(),
            next_seq,
            session_id: record.session_id,
            prior_state: record.prior_state,
            prior_waiting: record.prior_waiting,
            attached_observer: None,
            removed: false,
        }
    }

    /// Seq of the last buffered chunk, 0 when nothing arrived yet.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            task: self.task.clone(),
            session_id: self.session_id.clone(),
            prior_state: self.prior_state,
            prior_waiting: self.prior_waiting,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task: self.task.clone(),
            history: self.history.clone(),
            output_seq: self.last_seq(),
        }
    }

    /// Stashes the current state so a later re-attach can restore it, then
    /// moves to `disconnected`. The public waiting type clears with the state.
    pub fn stash_and_disconnect(&mut self) {
        self.prior_state = Some(self.task.state);
        self.prior_waiting = self.task.waiting_input_type;
        self.task.set_state(TaskState::Disconnected, None);
    }
}

pub async fn get_entry(state: &AppState, id: &str) -> AppResult<Arc<Mutex<TaskEntry>>> {
    let tasks = state.tasks.lock().await;
    tasks
        .get(id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("Task {id} not found")))
}

/// All live task records, for `tasks:updated` payloads. Never call while
/// holding an entry lock.
pub async fn live_tasks(state: &AppState) -> Vec<Task> {
    let entries: Vec<Arc<Mutex<TaskEntry>>> = {
        let tasks = state.tasks.lock().await;
        tasks.values().cloned().collect()
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.lock().await;
        if !entry.removed {
            out.push(entry.task.clone());
        }
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    out
}

/// Full snapshots (record + buffered output) for the `init` payload. Never
/// call while holding an entry lock.
pub async fn task_snapshots(state: &AppState) -> Vec<TaskSnapshot> {
    let entries: Vec<Arc<Mutex<TaskEntry>>> = {
        let tasks = state.tasks.lock().await;
        tasks.values().cloned().collect()
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.lock().await;
        if !entry.removed {
            out.push(entry.snapshot());
        }
    }
    out.sort_by(|a, b| a.task.created_at.cmp(&b.task.created_at));
    out
}

/// Writes the entry's row back to sqlite. Persistence of transitions is
/// best-effort: a failed write is logged, the in-memory registry stays
/// authoritative for the running server.
pub(crate) async fn persist_entry(state: &AppState, entry: &TaskEntry) {
    let record = entry.record();
    let task_id = record.task.id.clone();
    let state_clone = state.clone();
    match tokio::task::spawn_blocking(move || task_repo::update_task(&state_clone, &record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("[Registry:{task_id}] Failed to persist task: {e}"),
        Err(e) => log::error!("[Registry:{task_id}] Persist task panicked: {e}"),
    }
}

pub(crate) fn publish_state(state: &AppState, task: &Task) {
    state.hub.publish("task:stateChanged", json!({ "task": task }));
    if task.state == TaskState::WaitingInput {
        state.hub.publish(
            "task:waitingInput",
            json!({
                "taskId": task.id,
                "waitingInputType": task.waiting_input_type,
            }),
        );
    }
}

/// The single gate for live state changes: checks the transition graph,
/// applies it, persists the row and broadcasts the change.
pub(crate) async fn transition(
    state: &AppState,
    entry: &mut TaskEntry,
    to: TaskState,
    waiting: Option<WaitingInputType>,
) -> AppResult<()> {
    let from = entry.task.state;
    if !from.can_transition(to) {
        return Err(AppError::InvalidState(format!(
            "Task {} cannot move from {from} to {to}",
            entry.task.id
        )));
    }

    entry.task.set_state(to, waiting);
    log::info!("[Registry:{}] {from} -> {to}", entry.task.id);
    persist_entry(state, entry).await;
    publish_state(state, &entry.task);
    Ok(())
}

/// Broadcasts the full live list after membership changes (create, destroy,
/// archive, restore). Never call while holding an entry lock.
pub(crate) async fn publish_tasks_updated(state: &AppState) {
    let tasks = live_tasks(state).await;
    state.hub.publish("tasks:updated", json!({ "tasks": tasks }));
}
