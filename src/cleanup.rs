use crate::models::task::TaskState;
use crate::models::TS_FORMAT;
use crate::registry::archive;
use crate::state::AppState;

/// Background maintenance loop: periodically moves terminal tasks that
/// nobody touched for the configured window into the archive. Runs until the
/// shutdown token fires; does nothing per sweep when auto-archive is off.
pub fn start_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.config.sweep_interval;
        log::info!("[Sweeper] Starting, interval {}s", interval.as_secs());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    sweep(&state).await;
                }
                _ = state.shutdown.cancelled() => {
                    log::info!("[Sweeper] Stopped");
                    break;
                }
            }
        }
    })
}

async fn sweep(state: &AppState) {
    let Some(max_idle) = state.config.auto_archive_after else {
        log::debug!("[Sweeper] Auto-archive disabled, nothing to do");
        return;
    };
    let Ok(cutoff) = chrono::Duration::from_std(max_idle) else {
        return;
    };

    let entries = {
        let tasks = state.tasks.lock().await;
        tasks.values().cloned().collect::<Vec<_>>()
    };
    let now = chrono::Utc::now();
    let mut due = Vec::new();

    // Only finished tasks age out. Disconnected ones may still own a process
    // and are waiting on an observer's decision.
    for entry_arc in entries {
        let entry = entry_arc.lock().await;
        if entry.removed
            || !matches!(
                entry.task.state,
                TaskState::Exited | TaskState::Interrupted
            )
        {
            continue;
        }
        let Ok(last) = chrono::NaiveDateTime::parse_from_str(&entry.task.last_activity, TS_FORMAT)
        else {
            continue;
        };
        if now.signed_duration_since(last.and_utc()) >= cutoff {
            due.push(entry.task.id.clone());
        }
    }

    if due.is_empty() {
        return;
    }

    log::info!("[Sweeper] Auto-archiving {} stale task(s)", due.len());
    for task_id in due {
        if let Err(e) = archive::archive_task(state, &task_id).await {
            log::warn!("[Sweeper:{task_id}] Auto-archive failed: {e}");
        }
    }
}
