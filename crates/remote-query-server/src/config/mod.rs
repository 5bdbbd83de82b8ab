//! Configuration resolution.

use std::path::PathBuf;

pub const DATA_ENV: &str = "REMOTE_QUERY_DATA";
pub const ADDR_ENV: &str = "REMOTE_QUERY_ADDR";
pub const DEFAULT_ADDR: &str = "127.0.0.1:4100";

/// Resolve the dataset path: flag, then `REMOTE_QUERY_DATA`, then
/// `.remote-query/data.json` in the working directory, then the same
/// under `$HOME`.
pub fn resolve_data_path(explicit: Option<&str>) -> String {
    if let Some(path) = explicit {
        return path.to_string();
    }

    if let Ok(env_path) = std::env::var(DATA_ENV) {
        return env_path;
    }

    let cwd_data = PathBuf::from(".remote-query/data.json");
    if cwd_data.exists() {
        return cwd_data.display().to_string();
    }

    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    format!("{home}/.remote-query/data.json")
}

/// Resolve the listen/connect address: flag, then `REMOTE_QUERY_ADDR`.
pub fn resolve_addr(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(ADDR_ENV).ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
}
