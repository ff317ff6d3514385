use rusqlite::params;

use crate::error::{AppError, AppResult};
use crate::models::task::{Task, TaskGitState, TaskState, WaitingInputType};
use crate::state::AppState;

/// A live task row: the wire-visible record plus the registry-internal
/// fields that must survive a server restart.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub session_id: Option<String>,
    pub prior_state: Option<TaskState>,
    pub prior_waiting: Option<WaitingInputType>,
}

const TASK_COLS: &str = "id, workspace_id, prompt, system_prompt, state, waiting_input_type, \
     prior_state, prior_waiting_input_type, error, session_id, pid, attempt, git_state, \
     created_at, last_activity";

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
    let state_raw: String = row.get(4)?;
    let waiting_raw: Option<String> = row.get(5)?;
    let prior_raw: Option<String> = row.get(6)?;
    let prior_waiting_raw: Option<String> = row.get(7)?;
    let git_raw: Option<String> = row.get(12)?;
    let pid: Option<i64> = row.get(10)?;
    let attempt: i64 = row.get(11)?;

    let task = Task {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        prompt: row.get(2)?,
        system_prompt: row.get(3)?,
        state: TaskState::from_str(&state_raw).unwrap_or(TaskState::Disconnected),
        waiting_input_type: waiting_raw.as_deref().and_then(WaitingInputType::from_str),
        git_state: git_raw
            .as_deref()
            .and_then(|raw| serde_json::from_str::<TaskGitState>(raw).ok()),
        error: row.get(8)?,
        pid: pid.map(|p| p as u32),
        attempt: attempt as u32,
        created_at: row.get(13)?,
        last_activity: row.get(14)?,
    };

    Ok(TaskRecord {
        task,
        session_id: row.get(9)?,
        prior_state: prior_raw.as_deref().and_then(TaskState::from_str),
        prior_waiting: prior_waiting_raw
            .as_deref()
            .and_then(WaitingInputType::from_str),
    })
}

fn git_state_json(task: &Task) -> AppResult<Option<String>> {
    match &task.git_state {
        Some(gs) => Ok(Some(serde_json::to_string(gs)?)),
        None => Ok(None),
    }
}

pub fn insert_task(state: &AppState, record: &TaskRecord) -> AppResult<()> {
    let git = git_state_json(&record.task)?;
    let task = &record.task;
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        &format!("INSERT INTO tasks ({TASK_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
        params![
            task.id,
            task.workspace_id,
            task.prompt,
            task.system_prompt,
            task.state.as_str(),
            task.waiting_input_type.map(|w| w.as_str()),
            record.prior_state.map(|s| s.as_str()),
            record.prior_waiting.map(|w| w.as_str()),
            task.error,
            record.session_id,
            task.pid.map(|p| p as i64),
            task.attempt as i64,
            git,
            task.created_at,
            task.last_activity,
        ],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn update_task(state: &AppState, record: &TaskRecord) -> AppResult<()> {
    let git = git_state_json(&record.task)?;
    let task = &record.task;
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let changed = db
        .execute(
            "UPDATE tasks SET state = ?2, waiting_input_type = ?3, prior_state = ?4, \
             prior_waiting_input_type = ?5, error = ?6, session_id = ?7, pid = ?8, \
             attempt = ?9, git_state = ?10, last_activity = ?11 WHERE id = ?1",
            params![
                task.id,
                task.state.as_str(),
                task.waiting_input_type.map(|w| w.as_str()),
                record.prior_state.map(|s| s.as_str()),
                record.prior_waiting.map(|w| w.as_str()),
                task.error,
                record.session_id,
                task.pid.map(|p| p as i64),
                task.attempt as i64,
                git,
                task.last_activity,
            ],
        )
        .map_err(|e| AppError::Database(e.to_string()))?;

    if changed == 0 {
        return Err(AppError::NotFound(format!("Task {} not found", task.id)));
    }
    Ok(())
}

pub fn load_tasks(state: &AppState) -> AppResult<Vec<TaskRecord>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare(&format!(
            "SELECT {TASK_COLS} FROM tasks ORDER BY created_at ASC"
        ))
        .map_err(|e| AppError::Database(e.to_string()))?;

    let records = stmt
        .query_map([], |row| row_to_record(row))
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(records)
}

pub fn delete_task(state: &AppState, id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    // task_output rows go with the task via ON DELETE CASCADE
    db.execute("DELETE FROM tasks WHERE id = ?1", params![id])
        .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn append_output(state: &AppState, task_id: &str, seq: u64, chunk: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "INSERT INTO task_output (task_id, seq, chunk) VALUES (?1, ?2, ?3)",
        params![task_id, seq as i64, chunk],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn load_output(state: &AppState, task_id: &str) -> AppResult<Vec<(u64, String)>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare("SELECT seq, chunk FROM task_output WHERE task_id = ?1 ORDER BY seq ASC")
        .map_err(|e| AppError::Database(e.to_string()))?;

    let chunks = stmt
        .query_map(params![task_id], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
        })
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::TaskState;

    fn record_for(task: Task) -> TaskRecord {
        TaskRecord {
            task,
            session_id: Some("sess-1".into()),
            prior_state: None,
            prior_waiting: None,
        }
    }

    #[tokio::test]
    async fn task_rows_roundtrip_with_internal_fields() {
        let (state, dir) = crate::state_for_tests().await;
        let ws = crate::test_workspace(&state, dir.path(), "repo");

        let mut task = Task::new(&ws, "count to 5", Some("be brief".into()));
        task.set_state(TaskState::Starting, None);
        task.pid = Some(4242);
        task.attempt = 1;
        insert_task(&state, &record_for(task.clone())).expect("insert");

        task.set_state(TaskState::Disconnected, None);
        let record = TaskRecord {
            task: task.clone(),
            session_id: Some("sess-2".into()),
            prior_state: Some(TaskState::Busy),
            prior_waiting: None,
        };
        update_task(&state, &record).expect("update");

        let loaded = load_tasks(&state).expect("load");
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.task.id, task.id);
        assert_eq!(got.task.state, TaskState::Disconnected);
        assert_eq!(got.task.prompt, "count to 5");
        assert_eq!(got.session_id.as_deref(), Some("sess-2"));
        assert_eq!(got.prior_state, Some(TaskState::Busy));

        delete_task(&state, &task.id).expect("delete");
        assert!(load_tasks(&state).expect("load").is_empty());
    }

    #[tokio::test]
    async fn output_log_preserves_order_and_cascades() {
        let (state, dir) = crate::state_for_tests().await;
        let ws = crate::test_workspace(&state, dir.path(), "repo");
        let task = Task::new(&ws, "p", None);
        insert_task(&state, &record_for(task.clone())).expect("insert");

        for (seq, chunk) in [(1u64, "one"), (2, "two"), (3, "three")] {
            append_output(&state, &task.id, seq, chunk).expect("append");
        }
        let chunks = load_output(&state, &task.id).expect("load output");
        assert_eq!(
            chunks,
            vec![
                (1, "one".to_string()),
                (2, "two".to_string()),
                (3, "three".to_string())
            ]
        );

        delete_task(&state, &task.id).expect("delete");
        assert!(load_output(&state, &task.id).expect("load").is_empty());
    }
}
