use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Spawn failure: {0}")]
    Spawn(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Process lost: {0}")]
    ProcessLost(String),

    #[error("Revert precondition failed: {0}")]
    RevertPrecondition(String),

    #[error("Archive integrity: {0}")]
    ArchiveIntegrity(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code carried on every `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::Spawn(_) => "SPAWN_FAILURE",
            AppError::InvalidState(_) => "INVALID_STATE_TRANSITION",
            AppError::ProcessLost(_) => "PROCESS_LOST",
            AppError::RevertPrecondition(_) => "REVERT_PRECONDITION",
            AppError::ArchiveIntegrity(_) => "ARCHIVE_INTEGRITY",
            AppError::Workspace(_) => "WORKSPACE",
            AppError::Git(_) => "GIT",
            AppError::Io(_) => "IO",
            AppError::Serde(_) => "SERDE",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    /// Variant name, reported alongside the code for diagnostics when an
    /// internal failure is translated into a client-visible error.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "Database",
            AppError::NotFound(_) => "NotFound",
            AppError::InvalidRequest(_) => "InvalidRequest",
            AppError::Spawn(_) => "Spawn",
            AppError::InvalidState(_) => "InvalidState",
            AppError::ProcessLost(_) => "ProcessLost",
            AppError::RevertPrecondition(_) => "RevertPrecondition",
            AppError::ArchiveIntegrity(_) => "ArchiveIntegrity",
            AppError::Workspace(_) => "Workspace",
            AppError::Git(_) => "Git",
            AppError::Io(_) => "Io",
            AppError::Serde(_) => "Serde",
            AppError::Internal(_) => "Internal",
        }
    }

    /// Payload for the `error` event: message, stable code, variant name.
    pub fn to_event_payload(&self) -> serde_json::Value {
        json!({
            "message": self.to_string(),
            "code": self.code(),
            "kind": self.kind(),
        })
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::Spawn("x".into()).code(), "SPAWN_FAILURE");
        assert_eq!(
            AppError::InvalidState("x".into()).code(),
            "INVALID_STATE_TRANSITION"
        );
        assert_eq!(
            AppError::RevertPrecondition("x".into()).code(),
            "REVERT_PRECONDITION"
        );
    }

    #[test]
    fn event_payload_carries_message_code_kind() {
        let payload = AppError::ArchiveIntegrity("no archived task abc".into()).to_event_payload();
        assert_eq!(payload["code"], "ARCHIVE_INTEGRITY");
        assert_eq!(payload["kind"], "ArchiveIntegrity");
        assert!(payload["message"]
            .as_str()
            .unwrap()
            .contains("no archived task abc"));
    }
}
