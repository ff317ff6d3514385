use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{AppError, AppResult};
use crate::models::task::WaitingInputType;
use crate::state::AppState;

/// One backing OS process for a task attempt.
#[derive(Debug)]
pub struct TaskProcess {
    pub task_id: String,
    pub session_id: String,
    pub attempt: u32,
    pub pid: Option<u32>,
    pub child: Child,
    pub stdin: Arc<AsyncMutex<BufWriter<ChildStdin>>>,
    pub reader_handle: tokio::task::JoinHandle<()>,
    /// Captured stderr lines for debugging
    pub stderr_lines: Arc<AsyncMutex<Vec<String>>>,
}

/// What the reader task extracts from the child's stdout. Process death is
/// observed separately: the event channel closing means the stream ended and
/// the child should be reaped.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Output(String),
    WaitingInput(WaitingInputType),
}

/// A stdout line announcing that the process is paused for input. The wrapper
/// hooks emit `{"type":"awaiting_input","input_type":"..."}`; any other line
/// is ordinary output.
pub fn parse_wait_marker(line: &str) -> Option<WaitingInputType> {
    let value = serde_json::from_str::<serde_json::Value>(line.trim()).ok()?;
    if value.get("type")?.as_str()? != "awaiting_input" {
        return None;
    }
    Some(match value.get("input_type").and_then(|v| v.as_str()) {
        Some(raw) => WaitingInputType::from_notification(raw),
        None => WaitingInputType::Question,
    })
}

pub async fn spawn_task_process(
    task_id: &str,
    session_id: &str,
    attempt: u32,
    program: &str,
    args: &[String],
    workspace_dir: &Path,
    extra_env: &HashMap<String, String>,
) -> AppResult<(TaskProcess, mpsc::Receiver<ProcessEvent>)> {
    log::info!(
        "[Supervisor:{task_id}] Spawning attempt {attempt}: program={program}, args={args:?}, cwd={}",
        workspace_dir.display()
    );

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(workspace_dir)
        .envs(extra_env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        log::error!("[Supervisor:{task_id}] Failed to spawn '{program}': {e}");
        AppError::Spawn(format!("Failed to spawn '{program}': {e}"))
    })?;

    let pid = child.id();
    log::info!("[Supervisor:{task_id}] Process spawned with PID: {pid:?}");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("Failed to capture process stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("Failed to capture process stdout".into()))?;

    let (event_tx, event_rx) = mpsc::channel::<ProcessEvent>(256);
    let reader_handle = spawn_reader_task(task_id.to_string(), stdout, event_tx);

    // Capture stderr for diagnostics
    let stderr_lines = Arc::new(AsyncMutex::new(Vec::<String>::new()));
    if let Some(stderr) = child.stderr.take() {
        let id_str = task_id.to_string();
        let stderr_buf = stderr_lines.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::warn!("[Supervisor:{id_str}:stderr] {line}");
                let mut buf = stderr_buf.lock().await;
                // Keep last 50 lines
                if buf.len() >= 50 {
                    buf.remove(0);
                }
                buf.push(line);
            }
        });
    }

    // Brief delay to let the process start, then check it did not die on
    // arrival (missing binary errors surface at spawn, bad args right after).
    tokio::time::sleep(Duration::from_millis(200)).await;
    match child.try_wait() {
        Ok(Some(exit_status)) => {
            let stderr_output = {
                let lines = stderr_lines.lock().await;
                if lines.is_empty() {
                    "(no stderr output)".to_string()
                } else {
                    lines.join("\n")
                }
            };
            let msg = format!(
                "Process exited immediately with {exit_status}\nCommand: {program} {}\nStderr:\n{stderr_output}",
                args.join(" ")
            );
            log::error!("[Supervisor:{task_id}] {msg}");
            return Err(AppError::Spawn(msg));
        }
        Ok(None) => {}
        Err(e) => {
            log::warn!("[Supervisor:{task_id}] Could not check process status: {e}");
        }
    }

    let process = TaskProcess {
        task_id: task_id.to_string(),
        session_id: session_id.to_string(),
        attempt,
        pid,
        child,
        stdin: Arc::new(AsyncMutex::new(BufWriter::new(stdin))),
        reader_handle,
        stderr_lines,
    };

    Ok((process, event_rx))
}

fn spawn_reader_task(
    task_id: String,
    stdout: ChildStdout,
    tx: mpsc::Sender<ProcessEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();

        let mut line_count = 0u64;
        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            let event = match parse_wait_marker(&line) {
                Some(input_type) => ProcessEvent::WaitingInput(input_type),
                None => ProcessEvent::Output(line),
            };
            if tx.send(event).await.is_err() {
                log::warn!("[Supervisor:{task_id}] Event channel closed, stopping reader");
                break;
            }
        }
        log::info!("[Supervisor:{task_id}] Stdout reader ended after {line_count} lines");
    })
}

/// Writes one line of input to the task's process. Fails if no process is
/// registered for the task.
pub async fn write_input(state: &AppState, task_id: &str, text: &str) -> AppResult<()> {
    use tokio::io::AsyncWriteExt;

    let stdin = {
        let processes = state.processes.lock().await;
        let process = processes.get(task_id).ok_or_else(|| {
            AppError::ProcessLost(format!("No process registered for task {task_id}"))
        })?;
        process.stdin.clone()
    };

    let mut stdin = stdin.lock().await;
    stdin.write_all(text.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;

    Ok(())
}

/// Whether the registered process for a task is still running.
pub async fn check_alive(state: &AppState, task_id: &str) -> bool {
    let mut processes = state.processes.lock().await;
    match processes.get_mut(task_id) {
        Some(process) => match process.child.try_wait() {
            Ok(Some(_)) => false, // process has exited
            Ok(None) => true,     // still running
            Err(e) => {
                log::warn!("[Supervisor:{task_id}] Failed to check process status: {e}");
                false // treat as dead on error
            }
        },
        None => false,
    }
}

/// Removes the process for a task and terminates it. With a grace period the
/// child first gets a SIGINT and time to exit on its own; without one (and on
/// escalation) it is killed outright. Returns false if no process was
/// registered, which makes repeated interrupt/destroy calls no-ops.
pub async fn kill_task_process(
    state: &AppState,
    task_id: &str,
    grace: Option<Duration>,
) -> AppResult<bool> {
    let mut process = {
        let mut processes = state.processes.lock().await;
        match processes.remove(task_id) {
            Some(p) => p,
            None => return Ok(false),
        }
    };

    if let Some(grace) = grace {
        if try_graceful_stop(&mut process, task_id, grace).await {
            process.reader_handle.abort();
            return Ok(true);
        }
        log::info!("[Supervisor:{task_id}] Grace period elapsed, force killing");
    }

    process
        .child
        .kill()
        .await
        .map_err(|e| AppError::Internal(format!("Failed to kill process: {e}")))?;
    Ok(true)
}

#[cfg(unix)]
async fn try_graceful_stop(process: &mut TaskProcess, task_id: &str, grace: Duration) -> bool {
    let Some(pid) = process.child.id() else {
        return false;
    };
    log::info!("[Supervisor:{task_id}] Sending SIGINT to pid {pid}");
    let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        match process.child.try_wait() {
            Ok(Some(status)) => {
                log::info!("[Supervisor:{task_id}] Process exited gracefully with {status}");
                return true;
            }
            Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(e) => {
                log::warn!("[Supervisor:{task_id}] try_wait failed during grace period: {e}");
                return false;
            }
        }
    }
    false
}

#[cfg(not(unix))]
async fn try_graceful_stop(_process: &mut TaskProcess, _task_id: &str, _grace: Duration) -> bool {
    false
}

/// Removes and waits the process after its stdout closed. Returns the exit
/// code when this call actually reaped it; None when another path (interrupt,
/// destroy) already took the process, or when the registered process belongs
/// to a newer attempt than the closed stream.
pub async fn reap(state: &AppState, task_id: &str, attempt: u32) -> Option<AppResult<Option<i32>>> {
    let mut process = {
        let mut processes = state.processes.lock().await;
        match processes.get(task_id) {
            Some(p) if p.attempt == attempt => processes.remove(task_id)?,
            _ => return None,
        }
    };

    match process.child.wait().await {
        Ok(status) => Some(Ok(status.code())),
        Err(e) => Some(Err(AppError::ProcessLost(format!(
            "Failed to wait on process for task {task_id}: {e}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_marker_parsing() {
        assert_eq!(
            parse_wait_marker(r#"{"type":"awaiting_input","input_type":"permission"}"#),
            Some(WaitingInputType::Permission)
        );
        assert_eq!(
            parse_wait_marker(r#"{"type":"awaiting_input"}"#),
            Some(WaitingInputType::Question)
        );
        assert_eq!(
            parse_wait_marker(r#"{"type":"awaiting_input","input_type":"user_idle"}"#),
            Some(WaitingInputType::Idle)
        );
        assert_eq!(parse_wait_marker("plain output line"), None);
        assert_eq!(parse_wait_marker(r#"{"type":"result"}"#), None);
        assert_eq!(parse_wait_marker(""), None);
    }

    #[tokio::test]
    async fn spawn_echo_write_and_reap() {
        let (state, dir) = crate::state_for_tests().await;
        let (process, mut rx) = spawn_task_process(
            "t1",
            "sess",
            1,
            "cat",
            &[],
            dir.path(),
            &HashMap::new(),
        )
        .await
        .expect("spawn cat");
        state
            .processes
            .lock()
            .await
            .insert("t1".to_string(), process);

        write_input(&state, "t1", "hello").await.expect("write");
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("echo within 5s")
            .expect("channel open");
        assert_eq!(event, ProcessEvent::Output("hello".to_string()));

        assert!(check_alive(&state, "t1").await);
        assert!(kill_task_process(&state, "t1", None).await.expect("kill"));
        assert!(!check_alive(&state, "t1").await);

        // Second kill is a no-op
        assert!(!kill_task_process(&state, "t1", None).await.expect("kill"));
    }

    #[tokio::test]
    async fn reap_is_scoped_to_the_attempt_that_ended() {
        let (state, dir) = crate::state_for_tests().await;
        let args = vec!["-c".to_string(), "read line; exit 7".to_string()];
        let (process, _rx) =
            spawn_task_process("t4", "sess", 1, "sh", &args, dir.path(), &HashMap::new())
                .await
                .expect("spawn sh");
        state
            .processes
            .lock()
            .await
            .insert("t4".to_string(), process);

        write_input(&state, "t4", "go").await.expect("write");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while check_alive(&state, "t4").await {
            assert!(tokio::time::Instant::now() < deadline, "sh did not exit");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // A stream from a different attempt must not take the process
        assert!(reap(&state, "t4", 2).await.is_none());

        match reap(&state, "t4", 1).await {
            Some(Ok(code)) => assert_eq!(code, Some(7)),
            other => panic!("expected exit code, got {other:?}"),
        }

        // Already reaped
        assert!(reap(&state, "t4", 1).await.is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = spawn_task_process(
            "t2",
            "sess",
            1,
            "/definitely/not/a/binary",
            &[],
            dir.path(),
            &HashMap::new(),
        )
        .await;
        assert!(matches!(result, Err(AppError::Spawn(_))));
    }

    #[tokio::test]
    async fn immediate_exit_is_a_spawn_failure_with_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let result =
            spawn_task_process("t3", "sess", 1, "sh", &args, dir.path(), &HashMap::new()).await;
        match result {
            Err(AppError::Spawn(msg)) => assert!(msg.contains("boom"), "stderr missing: {msg}"),
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }
}
