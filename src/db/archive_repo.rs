use rusqlite::params;

use crate::error::{AppError, AppResult};
use crate::models::archive::ArchivedTask;
use crate::models::task::Task;
use crate::state::AppState;

fn row_to_archived(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String)> {
    Ok((row.get(1)?, row.get(2)?, row.get(3)?))
}

const ARCHIVE_COLS: &str = "id, task_json, history_json, archived_at";

fn decode(task_json: &str, history_json: &str, archived_at: String) -> AppResult<ArchivedTask> {
    Ok(ArchivedTask {
        task: serde_json::from_str(task_json)?,
        history: serde_json::from_str(history_json)?,
        archived_at,
    })
}

pub fn list_archived(state: &AppState) -> AppResult<Vec<ArchivedTask>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare(&format!(
            "SELECT {ARCHIVE_COLS} FROM archived_tasks ORDER BY archived_at DESC"
        ))
        .map_err(|e| AppError::Database(e.to_string()))?;

    let rows = stmt
        .query_map([], |row| row_to_archived(row))
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;
    drop(stmt);
    drop(db);

    rows.into_iter()
        .map(|(task_json, history_json, archived_at)| decode(&task_json, &history_json, archived_at))
        .collect()
}

pub fn get_archived(state: &AppState, id: &str) -> AppResult<ArchivedTask> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let row = db
        .query_row(
            &format!("SELECT {ARCHIVE_COLS} FROM archived_tasks WHERE id = ?1"),
            params![id],
            |row| row_to_archived(row),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                AppError::ArchiveIntegrity(format!("No archived task {id}"))
            }
            _ => AppError::Database(e.to_string()),
        })?;
    drop(db);

    decode(&row.0, &row.1, row.2)
}

pub fn delete_archived(state: &AppState, id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let deleted = db
        .execute("DELETE FROM archived_tasks WHERE id = ?1", params![id])
        .map_err(|e| AppError::Database(e.to_string()))?;
    if deleted == 0 {
        return Err(AppError::ArchiveIntegrity(format!("No archived task {id}")));
    }
    Ok(())
}

/// Moves a live task row (and its output log) into the archive in one
/// transaction, so the task is never visible in both places.
pub fn move_to_archive(state: &AppState, archived: &ArchivedTask) -> AppResult<()> {
    let task_json = serde_json::to_string(&archived.task)?;
    let history_json = serde_json::to_string(&archived.history)?;

    let mut db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let tx = db
        .transaction()
        .map_err(|e| AppError::Database(e.to_string()))?;

    tx.execute(
        "INSERT INTO archived_tasks (id, task_json, history_json, archived_at) VALUES (?1, ?2, ?3, ?4)",
        params![archived.task.id, task_json, history_json, archived.archived_at],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    // task_output rows cascade with the task row
    tx.execute(
        "DELETE FROM tasks WHERE id = ?1",
        params![archived.task.id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    tx.commit().map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

/// The inverse move: re-creates the live task row and its output log and
/// removes the archive row, again atomically.
pub fn move_to_live(
    state: &AppState,
    task: &Task,
    history: &[String],
    session_id: Option<&str>,
) -> AppResult<()> {
    let git = match &task.git_state {
        Some(gs) => Some(serde_json::to_string(gs)?),
        None => None,
    };

    let mut db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let tx = db
        .transaction()
        .map_err(|e| AppError::Database(e.to_string()))?;

    tx.execute(
        "INSERT INTO tasks (id, workspace_id, prompt, system_prompt, state, waiting_input_type, \
         prior_state, prior_waiting_input_type, error, session_id, pid, attempt, git_state, \
         created_at, last_activity) \
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            task.id,
            task.workspace_id,
            task.prompt,
            task.system_prompt,
            task.state.as_str(),
            task.error,
            session_id,
            task.pid.map(|p| p as i64),
            task.attempt as i64,
            git,
            task.created_at,
            task.last_activity,
        ],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    for (i, chunk) in history.iter().enumerate() {
        tx.execute(
            "INSERT INTO task_output (task_id, seq, chunk) VALUES (?1, ?2, ?3)",
            params![task.id, (i + 1) as i64, chunk],
        )
        .map_err(|e| AppError::Database(e.to_string()))?;
    }

    let removed = tx
        .execute("DELETE FROM archived_tasks WHERE id = ?1", params![task.id])
        .map_err(|e| AppError::Database(e.to_string()))?;
    if removed == 0 {
        return Err(AppError::ArchiveIntegrity(format!(
            "No archived task {}",
            task.id
        )));
    }

    tx.commit().map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::task_repo;
    use crate::models::task::TaskState;

    #[tokio::test]
    async fn archive_moves_are_atomic_and_exclusive() {
        let (state, dir) = crate::state_for_tests().await;
        let ws = crate::test_workspace(&state, dir.path(), "repo");

        let mut task = Task::new(&ws, "will be archived", None);
        task.set_state(TaskState::Starting, None);
        task.set_state(TaskState::Busy, None);
        task.set_state(TaskState::Exited, None);
        task_repo::insert_task(
            &state,
            &task_repo::TaskRecord {
                task: task.clone(),
                session_id: None,
                prior_state: None,
                prior_waiting: None,
            },
        )
        .expect("insert");
        task_repo::append_output(&state, &task.id, 1, "hello").expect("append");

        let mut snapshot = task.clone();
        snapshot.set_state(TaskState::Archived, None);
        let archived = ArchivedTask {
            task: snapshot,
            history: vec!["hello".into()],
            archived_at: crate::models::now_ts(),
        };
        move_to_archive(&state, &archived).expect("archive");

        // Gone from live, present in archive
        assert!(task_repo::load_tasks(&state).expect("load").is_empty());
        assert!(task_repo::load_output(&state, &task.id)
            .expect("output")
            .is_empty());
        let got = get_archived(&state, &task.id).expect("get archived");
        assert_eq!(got.task.id, task.id);
        assert_eq!(got.history, vec!["hello".to_string()]);

        // Restore: back in live, gone from archive
        let mut restored = got.task.clone();
        restored.state = TaskState::Idle;
        move_to_live(&state, &restored, &got.history, None).expect("restore");
        assert_eq!(task_repo::load_tasks(&state).expect("load").len(), 1);
        assert_eq!(
            task_repo::load_output(&state, &task.id).expect("output").len(),
            1
        );
        assert!(matches!(
            get_archived(&state, &task.id),
            Err(AppError::ArchiveIntegrity(_))
        ));
    }

    #[tokio::test]
    async fn missing_archive_ids_are_integrity_errors() {
        let (state, _dir) = crate::state_for_tests().await;
        assert!(matches!(
            get_archived(&state, "nope"),
            Err(AppError::ArchiveIntegrity(_))
        ));
        assert!(matches!(
            delete_archived(&state, "nope"),
            Err(AppError::ArchiveIntegrity(_))
        ));
    }
}
