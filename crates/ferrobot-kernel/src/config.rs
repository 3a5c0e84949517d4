//! Robot configuration loading – reads a TOML snapshot from disk and
//! validates it before it ever reaches the differ.

use std::fs;
use std::path::Path;

use ferrobot_types::{RobotConfig, RobotError};

/// Parse and validate a snapshot from TOML text.
///
/// # Errors
///
/// Returns [`RobotError::Config`] on malformed TOML or when
/// [`RobotConfig::validate`] rejects the snapshot.
pub fn parse(raw: &str) -> Result<RobotConfig, RobotError> {
    let cfg: RobotConfig =
        toml::from_str(raw).map_err(|e| RobotError::Config(format!("failed to parse config: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load a snapshot from `path`.
///
/// # Errors
///
/// Returns [`RobotError::Config`] when the file cannot be read or parsed.
pub fn load_from(path: &Path) -> Result<RobotConfig, RobotError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        RobotError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    parse(&raw)
}
