//! Server configuration, loaded from `config.json` in the working
//! directory. Missing file or unparsable content falls back to defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeteorConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Log level: `info` or `debug`.
    pub log_level: String,
    /// When false, WAL row appends become no-ops. Testing only; the
    /// database loses durability.
    pub use_wal: bool,
}

impl Default for MeteorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7653,
            log_level: "info".to_string(),
            use_wal: true,
        }
    }
}

impl MeteorConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file is missing or malformed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config {}: {}, using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
