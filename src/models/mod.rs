pub mod archive;
pub mod event;
pub mod task;
pub mod workspace;

pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// UTC timestamp in the same format sqlite's `datetime('now')` produces.
pub fn now_ts() -> String {
    chrono::Utc::now().format(TS_FORMAT).to_string()
}
