use std::path::PathBuf;
use std::time::Duration;

use crate::db::migrations::default_base_dir;

/// Server configuration, resolved once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: String,
    /// Directory holding the sqlite database.
    pub data_dir: PathBuf,
    /// Binary spawned for each task attempt.
    pub claude_bin: String,
    /// Extra argv passed to the binary (the prompt goes over stdin).
    pub claude_args: Vec<String>,
    /// How long an interrupt waits for graceful exit before killing.
    pub interrupt_grace: Duration,
    /// Interval between maintenance sweeps.
    pub sweep_interval: Duration,
    /// Auto-archive terminal tasks idle longer than this. None disables it.
    pub auto_archive_after: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("TASKDECK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_base_dir());

        let claude_args = std::env::var("TASKDECK_CLAUDE_ARGS")
            .map(|v| v.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        let auto_archive_hours = env_u64("TASKDECK_AUTO_ARCHIVE_HOURS", 0);

        Self {
            bind_addr: env_or("TASKDECK_BIND", "127.0.0.1:3920"),
            data_dir,
            claude_bin: env_or("TASKDECK_CLAUDE_BIN", "claude"),
            claude_args,
            interrupt_grace: Duration::from_millis(env_u64("TASKDECK_GRACE_MS", 3000)),
            sweep_interval: Duration::from_secs(env_u64("TASKDECK_SWEEP_INTERVAL_SECS", 900)),
            auto_archive_after: match auto_archive_hours {
                0 => None,
                hours => Some(Duration::from_secs(hours * 3600)),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("[Config] {key}={raw} is not a number, using {default}");
            default
        }),
        Err(_) => default,
    }
}
