use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SensorKindConfig {
    /// Poll the classifier sidecar over HTTP.
    Http,
    /// No sensor; every sample reads inactive and the machine reports STOP.
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKindConfig,
    pub endpoint: String,
    pub timeout_ms: u64,
    pub min_confidence: f64,
    pub confirm_frames: u32,
}

/// Working window and break intervals as "HH:MM" wall-clock strings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShiftConfig {
    pub work_start: String,
    pub work_end: String,
    pub breaks: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub workspace_dir: PathBuf,
    pub http_listen: String,
    pub sample_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub stop_threshold_secs: i64,
    pub shift_seconds: i64,
    pub commit_retries: u32,
    pub log_filter: String,
    pub sensor: SensorConfig,
    pub shift: ShiftConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        // Be resilient in environments without HOME by falling back to CWD.
        let base_dir = dirs::home_dir()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let workspace_dir = base_dir.join(".machmon");

        Self {
            workspace_dir,
            http_listen: "127.0.0.1:8000".to_string(),
            sample_interval_ms: 250,
            idle_interval_ms: 1000,
            stop_threshold_secs: 10,
            shift_seconds: 27_000,
            commit_retries: 3,
            log_filter: "info".to_string(),
            sensor: SensorConfig {
                kind: SensorKindConfig::Http,
                endpoint: "http://127.0.0.1:8600/detect".to_string(),
                timeout_ms: 500,
                min_confidence: 0.5,
                confirm_frames: 3,
            },
            shift: ShiftConfig {
                work_start: "08:00".to_string(),
                work_end: "17:30".to_string(),
                breaks: vec![
                    ("10:00".to_string(), "10:15".to_string()),
                    ("12:00".to_string(), "13:00".to_string()),
                    ("15:00".to_string(), "15:15".to_string()),
                ],
            },
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let workspace_dir = Self::default().workspace_dir;
        Self::load_with_workspace(workspace_dir)
    }

    /// Load defaults, then the workspace `config.toml` if present, then
    /// `MACHMON_*` environment overrides.
    pub fn load_with_workspace(workspace_dir: PathBuf) -> Result<Self> {
        let config_path = crate::util::paths::config_file(&workspace_dir);
        let defaults = Self::default();

        let default_breaks: Vec<Vec<String>> = defaults
            .shift
            .breaks
            .iter()
            .map(|(start, end)| vec![start.clone(), end.clone()])
            .collect();

        let mut builder = Config::builder()
            // Avoid panics on non-UTF8 paths by using lossy conversion.
            .set_default("workspace_dir", workspace_dir.to_string_lossy().as_ref())?
            .set_default("http_listen", defaults.http_listen.as_str())?
            .set_default("sample_interval_ms", defaults.sample_interval_ms)?
            .set_default("idle_interval_ms", defaults.idle_interval_ms)?
            .set_default("stop_threshold_secs", defaults.stop_threshold_secs)?
            .set_default("shift_seconds", defaults.shift_seconds)?
            .set_default("commit_retries", defaults.commit_retries)?
            .set_default("log_filter", defaults.log_filter.as_str())?
            .set_default("sensor.kind", "http")?
            .set_default("sensor.endpoint", defaults.sensor.endpoint.as_str())?
            .set_default("sensor.timeout_ms", defaults.sensor.timeout_ms)?
            .set_default("sensor.min_confidence", defaults.sensor.min_confidence)?
            .set_default("sensor.confirm_frames", defaults.sensor.confirm_frames)?
            .set_default("shift.work_start", defaults.shift.work_start.as_str())?
            .set_default("shift.work_end", defaults.shift.work_end.as_str())?
            .set_default("shift.breaks", default_breaks)?;

        // Load config file if it exists
        if config_path.exists() {
            builder = builder.add_source(File::from(config_path));
        }

        // Allow environment variables to override config
        builder = builder.add_source(Environment::with_prefix("MACHMON"));

        let config = builder.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }
}

/// Base URL of the daemon's HTTP API for a given listen address.
pub fn api_base_url(http_listen: &str) -> String {
    format!("http://{http_listen}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_settings() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.stop_threshold_secs, 10);
        assert_eq!(cfg.shift_seconds, 27_000);
        assert_eq!(cfg.sensor.confirm_frames, 3);
        assert_eq!(cfg.shift.breaks.len(), 3);
        assert_eq!(cfg.shift.work_start, "08:00");
        assert_eq!(cfg.shift.work_end, "17:30");
        assert!(cfg.workspace_dir.ends_with(".machmon"));
    }

    #[test]
    fn workspace_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            crate::util::paths::config_file(dir.path()),
            r#"
stop_threshold_secs = 25
http_listen = "0.0.0.0:9001"

[sensor]
kind = "none"
confirm_frames = 1
"#,
        )
        .expect("write config");

        let cfg = AppConfig::load_with_workspace(dir.path().to_path_buf()).expect("load");
        assert_eq!(cfg.stop_threshold_secs, 25);
        assert_eq!(cfg.http_listen, "0.0.0.0:9001");
        assert_eq!(cfg.sensor.kind, SensorKindConfig::None);
        assert_eq!(cfg.sensor.confirm_frames, 1);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.shift_seconds, 27_000);
        assert_eq!(cfg.shift.work_end, "17:30");
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig::load_with_workspace(dir.path().to_path_buf()).expect("load");
        assert_eq!(cfg.sample_interval_ms, 250);
        assert_eq!(cfg.sensor.min_confidence, 0.5);
    }

    #[test]
    fn api_base_url_prefixes_scheme() {
        assert_eq!(api_base_url("127.0.0.1:8000"), "http://127.0.0.1:8000");
    }
}
