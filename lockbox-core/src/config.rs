//! TOML configuration.
//!
//! Location: `$LOCKBOX_CONFIG`, else `$XDG_CONFIG_HOME/lockbox/config.toml`,
//! else `~/.config/lockbox/config.toml`.  A missing file yields defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths::{DEFAULT_ALIAS, SERVICE_BUS_NAME};
use crate::{CONTENT_TYPE_TEXT, Error, Result};

pub const CONFIG_ENV: &str = "LOCKBOX_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bus_name")]
    pub bus_name: String,
    /// Alias or object path used when a store names no collection.
    #[serde(default = "default_collection")]
    pub default_collection: String,
    #[serde(default = "default_session_algorithm")]
    pub session_algorithm: String,
    /// Load the collection table when a handle is opened.
    #[serde(default)]
    pub load_collections: bool,
    /// Negotiate the transfer session when a handle is opened.
    #[serde(default)]
    pub open_session: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bus_name: default_bus_name(),
            default_collection: default_collection(),
            session_algorithm: default_session_algorithm(),
            load_collections: false,
            open_session: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Window handle passed to `Prompt.Prompt` so the service can parent its
    /// dialog.
    #[serde(default)]
    pub window_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_collection_label")]
    pub default_collection_label: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_collection_label: default_collection_label(),
            content_type: default_content_type(),
        }
    }
}

fn default_bus_name() -> String {
    SERVICE_BUS_NAME.to_string()
}

fn default_collection() -> String {
    DEFAULT_ALIAS.to_string()
}

fn default_session_algorithm() -> String {
    "plain".to_string()
}

fn default_collection_label() -> String {
    "Default keyring".to_string()
}

fn default_content_type() -> String {
    CONTENT_TYPE_TEXT.to_string()
}

impl Config {
    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::InvalidFileFormat(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
        };
        Self::parse(&raw).map_err(|e| match e {
            Error::InvalidFileFormat(msg) => {
                Error::InvalidFileFormat(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::InvalidFileFormat(e.to_string()))
    }
}

/// Resolve the config file path.
pub fn config_path() -> PathBuf {
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(p);
    }
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("lockbox").join("config.toml")
}
