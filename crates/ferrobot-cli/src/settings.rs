//! Runtime settings for the `ferrobot` binary.
//!
//! Settings live in an optional `[runtime]` table of the robot config file
//! itself; the robot loader ignores that table and this one ignores
//! everything else.
//!
//! ```toml
//! [runtime]
//! poll_interval_ms = 500
//! build_timeout_ms = 30000
//! service_name = "left-arm-cell"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    /// Robot config file. Taken from the command line or `FERROBOT_CONFIG`,
    /// never from the file itself.
    #[serde(skip, default = "default_config_path")]
    pub config_path: PathBuf,

    /// How often the config file is checked for changes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single resource constructor.
    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,

    /// Service name reported to the trace exporter.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Deserialize)]
struct SettingsFile {
    #[serde(default)]
    runtime: Option<Settings>,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("robot.toml")
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_build_timeout_ms() -> u64 {
    60_000
}
fn default_service_name() -> String {
    "ferrobot".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            poll_interval_ms: default_poll_interval_ms(),
            build_timeout_ms: default_build_timeout_ms(),
            service_name: default_service_name(),
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

/// Resolve the config path (argument, then `FERROBOT_CONFIG`, then
/// `robot.toml`) and load the settings stored next to the robot config.
///
/// A missing file yields the defaults; the robot loader reports it later.
pub fn load(arg: Option<&str>) -> Result<Settings, String> {
    let path = arg
        .map(PathBuf::from)
        .or_else(|| std::env::var("FERROBOT_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_path);
    let mut settings = load_from(&path)?;
    apply_env_overrides(&mut settings);
    settings.config_path = path;
    Ok(settings)
}

/// Read the `[runtime]` table of `path`.
pub(crate) fn load_from(path: &Path) -> Result<Settings, String> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let file: SettingsFile =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse runtime settings: {}", e))?;
    Ok(file.runtime.unwrap_or_default())
}

/// Apply `FERROBOT_*` environment variable overrides to `settings`.
///
/// | Variable | Settings field |
/// |---|---|
/// | `FERROBOT_POLL_INTERVAL_MS` | `poll_interval_ms` |
/// | `FERROBOT_BUILD_TIMEOUT_MS` | `build_timeout_ms` |
/// | `FERROBOT_SERVICE_NAME` | `service_name` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(v) = std::env::var("FERROBOT_POLL_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        settings.poll_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("FERROBOT_BUILD_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        settings.build_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("FERROBOT_SERVICE_NAME") {
        settings.service_name = v;
    }
}
