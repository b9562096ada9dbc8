//! Server configuration
//!
//! Defaults, then an optional JSON file, then command-line flags. Every
//! section may be partial; durations are milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;

use browser::SupervisorConfig;

use crate::channel::ChannelConfig;
use crate::error::{Result, ServerError};
use crate::server::ServerSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub channel: ChannelConfig,
    pub server: ServerSettings,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ServerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}
