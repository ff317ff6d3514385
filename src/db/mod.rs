pub mod archive_repo;
pub mod migrations;
pub mod task_repo;
pub mod workspace_repo;
