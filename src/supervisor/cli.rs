use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Result of probing the configured CLI binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliStatus {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl CliStatus {
    pub fn unknown() -> CliStatus {
        CliStatus {
            installed: false,
            version: None,
        }
    }
}

/// Runs `<bin> --version` with a bounded timeout. Any failure (missing
/// binary, non-zero exit, hang) reports not-installed rather than erroring:
/// the answer gates task creation, it is not itself a task.
pub async fn probe(claude_bin: &str) -> CliStatus {
    let mut cmd = tokio::process::Command::new(claude_bin);
    cmd.arg("--version").kill_on_drop(true);

    match tokio::time::timeout(Duration::from_secs(5), cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty());
            log::info!("[Cli] {claude_bin} present, version: {version:?}");
            CliStatus {
                installed: true,
                version,
            }
        }
        Ok(Ok(output)) => {
            log::warn!(
                "[Cli] {claude_bin} --version exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            CliStatus::unknown()
        }
        Ok(Err(e)) => {
            log::warn!("[Cli] {claude_bin} not runnable: {e}");
            CliStatus::unknown()
        }
        Err(_) => {
            log::warn!("[Cli] {claude_bin} --version timed out");
            CliStatus::unknown()
        }
    }
}

/// Probes and caches the result on the shared state.
pub async fn refresh(state: &AppState) -> CliStatus {
    let status = probe(&state.config.claude_bin).await;
    *state.cli_status.lock().await = status.clone();
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_reports_version_for_a_real_binary() {
        // git is guaranteed in the test environment and answers --version
        let status = probe("git").await;
        assert!(status.installed);
        assert!(status.version.expect("version").contains("git"));
    }

    #[tokio::test]
    async fn probe_reports_missing_binary() {
        let status = probe("/definitely/not/a/binary").await;
        assert!(!status.installed);
        assert!(status.version.is_none());
    }
}
