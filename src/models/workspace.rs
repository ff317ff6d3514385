use serde::{Deserialize, Serialize};

/// A filesystem root tasks execute inside. The absolute path doubles as the
/// unique key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
}
