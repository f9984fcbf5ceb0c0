use std::path::{Path, PathBuf};

// Well-known filenames used within the workspace directory
const PID_FILE_NAME: &str = "machmond.pid";
const DB_FILE_NAME: &str = "machmon.sqlite3";
const LOG_DIR_NAME: &str = "logs";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Path to the daemon PID file inside the workspace.
pub fn pid_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(PID_FILE_NAME)
}

/// Path to the SQLite database inside the workspace.
pub fn db_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(DB_FILE_NAME)
}

/// Directory that receives the daemon's rolling log files.
pub fn log_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(LOG_DIR_NAME)
}

/// Path to the optional TOML config file inside the workspace.
pub fn config_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(CONFIG_FILE_NAME)
}
