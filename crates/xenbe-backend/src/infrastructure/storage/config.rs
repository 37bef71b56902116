//! TOML configuration for the backend process.
//!
//! Loaded from an explicit path (default [`DEFAULT_CONFIG_PATH`]).  A missing
//! file is not an error: every field has a default, so a backend runs with no
//! configuration file at all.
//!
//! ```toml
//! [backend]
//! name = "backend"
//! device_class = "vif"
//! wait_for_frontend = false
//! # domain_id = 0          # read from the store when absent
//!
//! [store]
//! domain_list_path = "/local/domain"
//! device_dir = "device"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` take the value of
//! `some_fn()` when absent from the file, and whole sections may be omitted.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use xenbe_core::domain::paths::{DEVICE_DIR, DOMAIN_LIST_PATH};

/// Where the executable looks for its configuration by default.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/xenbe/backend.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Identity and attach behavior.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BackendSection {
    /// Name used in log lines.
    #[serde(default = "default_name")]
    pub name: String,
    /// Device class served, e.g. `"vif"` or `"vbd"`.
    #[serde(default = "default_device_class")]
    pub device_class: String,
    /// Create handlers only for frontends in the `Initializing` state.
    #[serde(default)]
    pub wait_for_frontend: bool,
    /// Domain this backend runs in.  Read from the store when absent.
    #[serde(default)]
    pub domain_id: Option<u16>,
}

/// Store layout.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StoreSection {
    /// Directory listing every running domain.
    #[serde(default = "default_domain_list_path")]
    pub domain_list_path: String,
    /// Per-domain directory holding device classes.
    #[serde(default = "default_device_dir")]
    pub device_dir: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "backend".to_string()
}
fn default_device_class() -> String {
    "vif".to_string()
}
fn default_domain_list_path() -> String {
    DOMAIN_LIST_PATH.to_string()
}
fn default_device_dir() -> String {
    DEVICE_DIR.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            device_class: default_device_class(),
            wait_for_frontend: false,
            domain_id: None,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            domain_list_path: default_domain_list_path(),
            device_dir: default_device_dir(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<BackendConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackendConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
