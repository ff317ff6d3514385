pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod git;
pub mod hub;
pub mod models;
pub mod registry;
pub mod server;
pub mod state;
pub mod supervisor;

use error::AppResult;

/// Boots the full server: config, database, startup reconciliation, CLI
/// probe, maintenance sweeper, then the HTTP/WebSocket listener. Returns
/// once the listener has drained after a shutdown signal.
pub async fn run() -> AppResult<()> {
    let config = config::Config::from_env();
    log::info!("[Taskdeck] Data dir: {}", config.data_dir.display());

    let conn = db::migrations::init_db(&config.data_dir)?;
    let state = state::AppState::new(conn, config);

    registry::reconnect::reconcile_on_startup(&state).await?;
    supervisor::cli::refresh(&state).await;
    let sweeper = cleanup::start_sweeper(state.clone());

    let result = server::serve(state.clone()).await;

    // Stop monitors and the sweeper, then take the child processes down so
    // nothing keeps writing to workspaces after the server is gone.
    state.shutdown.cancel();
    let _ = sweeper.await;
    shutdown_processes(&state).await;
    result
}

async fn shutdown_processes(state: &state::AppState) {
    let ids: Vec<String> = {
        let processes = state.processes.lock().await;
        processes.keys().cloned().collect()
    };
    for task_id in ids {
        if let Err(e) = supervisor::process::kill_task_process(state, &task_id, None).await {
            log::warn!("[Taskdeck:{task_id}] Shutdown kill failed: {e}");
        }
    }
}

/// Test fixture: a fresh state over a temp database, with `cat` standing in
/// for the real CLI so spawned "tasks" echo their stdin back line by line.
#[cfg(test)]
pub(crate) async fn state_for_tests() -> (state::AppState, tempfile::TempDir) {
    state_for_tests_with_bin("cat").await
}

#[cfg(test)]
pub(crate) async fn state_for_tests_with_bin(
    claude_bin: &str,
) -> (state::AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = db::migrations::init_db(dir.path()).expect("init db");
    let config = config::Config {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: dir.path().to_path_buf(),
        claude_bin: claude_bin.to_string(),
        claude_args: Vec::new(),
        interrupt_grace: std::time::Duration::from_millis(300),
        sweep_interval: std::time::Duration::from_secs(3600),
        auto_archive_after: None,
    };
    let state = state::AppState::new(conn, config);
    state.cli_status.lock().await.installed = true;
    (state, dir)
}

#[cfg(test)]
pub(crate) fn test_workspace(
    state: &state::AppState,
    base: &std::path::Path,
    name: &str,
) -> String {
    let path = base.join(name);
    std::fs::create_dir_all(&path).expect("create workspace dir");
    let req = models::workspace::CreateWorkspaceRequest {
        path: path.to_string_lossy().to_string(),
        name: None,
    };
    db::workspace_repo::create_workspace(state, req)
        .expect("register workspace")
        .id
}
