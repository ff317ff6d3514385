use std::path::Path;

use rusqlite::params;

use crate::error::{AppError, AppResult};
use crate::models::workspace::{CreateWorkspaceRequest, Workspace};
use crate::state::AppState;

fn row_to_workspace(row: &rusqlite::Row) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

const WORKSPACE_COLS: &str = "id, name, created_at";

pub fn list_workspaces(state: &AppState) -> AppResult<Vec<Workspace>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare(&format!(
            "SELECT {WORKSPACE_COLS} FROM workspaces ORDER BY created_at ASC"
        ))
        .map_err(|e| AppError::Database(e.to_string()))?;

    let workspaces = stmt
        .query_map([], |row| row_to_workspace(row))
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(workspaces)
}

pub fn get_workspace(state: &AppState, id: &str) -> AppResult<Workspace> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.query_row(
        &format!("SELECT {WORKSPACE_COLS} FROM workspaces WHERE id = ?1"),
        params![id],
        |row| row_to_workspace(row),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            AppError::NotFound(format!("Workspace {id} not found"))
        }
        _ => AppError::Database(e.to_string()),
    })
}

pub fn create_workspace(state: &AppState, req: CreateWorkspaceRequest) -> AppResult<Workspace> {
    let path = Path::new(&req.path);
    if !path.is_absolute() {
        return Err(AppError::Workspace(format!(
            "Workspace path must be absolute: {}",
            req.path
        )));
    }
    if !path.is_dir() {
        return Err(AppError::Workspace(format!(
            "Workspace path is not a directory: {}",
            req.path
        )));
    }

    // The absolute path is the id
    let id = req.path.clone();
    let name = req.name.filter(|n| !n.is_empty()).unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| req.path.clone())
    });

    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;

    let existing: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM workspaces WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Database(e.to_string()))?;
    if existing > 0 {
        return Err(AppError::Workspace(format!(
            "Workspace already registered: {id}"
        )));
    }

    db.execute(
        "INSERT INTO workspaces (id, name) VALUES (?1, ?2)",
        params![id, name],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    drop(db);
    get_workspace(state, &id)
}

pub fn delete_workspace(state: &AppState, id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;

    // Refuse while the workspace still owns live tasks
    let live: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM tasks WHERE workspace_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Database(e.to_string()))?;

    if live > 0 {
        return Err(AppError::Workspace(format!(
            "Workspace {id} still owns {live} live task(s)"
        )));
    }

    let deleted = db
        .execute("DELETE FROM workspaces WHERE id = ?1", params![id])
        .map_err(|e| AppError::Database(e.to_string()))?;

    if deleted == 0 {
        return Err(AppError::NotFound(format!("Workspace {id} not found")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_list_delete_roundtrip() {
        let (state, dir) = crate::state_for_tests().await;
        let ws_path = dir.path().join("proj");
        std::fs::create_dir_all(&ws_path).expect("mkdir");
        let path_str = ws_path.to_string_lossy().to_string();

        let ws = create_workspace(
            &state,
            CreateWorkspaceRequest {
                path: path_str.clone(),
                name: None,
            },
        )
        .expect("create");
        assert_eq!(ws.id, path_str);
        assert_eq!(ws.name, "proj");

        // Duplicate registration refused
        let dup = create_workspace(
            &state,
            CreateWorkspaceRequest {
                path: path_str.clone(),
                name: Some("again".into()),
            },
        );
        assert!(matches!(dup, Err(AppError::Workspace(_))));

        let all = list_workspaces(&state).expect("list");
        assert_eq!(all.len(), 1);

        delete_workspace(&state, &path_str).expect("delete");
        assert!(matches!(
            get_workspace(&state, &path_str),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn relative_or_missing_paths_refused() {
        let (state, _dir) = crate::state_for_tests().await;
        let relative = create_workspace(
            &state,
            CreateWorkspaceRequest {
                path: "not/absolute".into(),
                name: None,
            },
        );
        assert!(matches!(relative, Err(AppError::Workspace(_))));

        let missing = create_workspace(
            &state,
            CreateWorkspaceRequest {
                path: "/definitely/not/a/real/dir".into(),
                name: None,
            },
        );
        assert!(matches!(missing, Err(AppError::Workspace(_))));
    }
}
