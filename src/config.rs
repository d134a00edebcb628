use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::c_int;
use std::fs;
use std::path::Path;

use crate::geometry::Point;
use crate::ownership::{DEFAULT_CELL_VALUE, Origin};
use crate::telemetry::LogFormat;

/// Settings for the host entry point and the ownership demo. Every key is
/// optional in the JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub points: [Point; 2],
    pub cell_value: c_int,
    pub cell_origin: Origin,
    pub precision: usize,
    pub log_format: LogFormat,
    pub log_directives: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            points: [Point::new(1, 0), Point::new(0, 1)],
            cell_value: DEFAULT_CELL_VALUE,
            cell_origin: Origin::C,
            precision: 6,
            log_format: LogFormat::Pretty,
            log_directives: None,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
