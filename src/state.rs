use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hub::Hub;
use crate::registry::TaskEntry;
use crate::supervisor::cli::CliStatus;
use crate::supervisor::process::TaskProcess;

pub struct AppState {
    pub config: Arc<Config>,
    /// SQLite database connection
    pub db: Arc<std::sync::Mutex<Connection>>,
    /// Live task entries keyed by task id. The outer lock is held only for
    /// lookup/insert/remove; each entry's own lock serializes mutation.
    pub tasks: Arc<Mutex<HashMap<String, Arc<Mutex<TaskEntry>>>>>,
    /// Running backing processes keyed by task id
    pub processes: Arc<Mutex<HashMap<String, TaskProcess>>>,
    /// Maps supervisor session ids (one per spawn attempt) to task ids
    pub session_index: Arc<Mutex<HashMap<String, String>>>,
    /// Broadcast fan-out to connected observers
    pub hub: Hub,
    /// Result of the most recent CLI presence probe
    pub cli_status: Arc<Mutex<CliStatus>>,
    /// Cancelled on shutdown; background loops watch it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(conn: Connection, config: Config) -> Self {
        Self {
            config: Arc::new(config),
            db: Arc::new(std::sync::Mutex::new(conn)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            processes: Arc::new(Mutex::new(HashMap::new())),
            session_index: Arc::new(Mutex::new(HashMap::new())),
            hub: Hub::new(),
            cli_status: Arc::new(Mutex::new(CliStatus::unknown())),
            shutdown: CancellationToken::new(),
        }
    }
}

// Implement Clone manually to allow state sharing in spawned tasks
impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            db: Arc::clone(&self.db),
            tasks: Arc::clone(&self.tasks),
            processes: Arc::clone(&self.processes),
            session_index: Arc::clone(&self.session_index),
            hub: self.hub.clone(),
            cli_status: Arc::clone(&self.cli_status),
            shutdown: self.shutdown.clone(),
        }
    }
}
