//! Bridge configuration, loadable from JSON.
//!
//! Every field has a default, so an empty object (or no file at all) gives
//! the standard layout: 132 reserved slots, the `hostbind` import module and
//! the `__hb_*` export names.

use hostbind_abi::{exports, CONSTANT_SLOTS, DEFAULT_RESERVED_SLOTS, IMPORT_MODULE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Size of the fixed region at the start of the handle table.
    pub reserved_slots: u32,
    /// Module name every import is registered under.
    pub import_module: String,
    pub exports: ExportNames,
    pub random: RandomPreference,
    pub fetch: FetchConfig,
    pub sockets: SocketConfig,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reserved_slots: DEFAULT_RESERVED_SLOTS,
            import_module: IMPORT_MODULE.to_string(),
            exports: ExportNames::default(),
            random: RandomPreference::default(),
            fetch: FetchConfig::default(),
            sockets: SocketConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reserved_slots < CONSTANT_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "reserved_slots must be at least {CONSTANT_SLOTS}, got {}",
                self.reserved_slots
            )));
        }
        if self.import_module.is_empty() {
            return Err(ConfigError::Invalid("import_module must not be empty".into()));
        }
        for route in &self.fetch.routes {
            url::Url::parse(&route.url).map_err(|err| {
                ConfigError::Invalid(format!("static route {:?}: {err}", route.url))
            })?;
        }
        Ok(())
    }
}

/// Names of the exports the bridge resolves on the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportNames {
    pub memory: String,
    pub malloc: String,
    pub realloc: String,
    pub free: String,
    pub start: String,
    pub table: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            memory: exports::MEMORY.to_string(),
            malloc: exports::MALLOC.to_string(),
            realloc: exports::REALLOC.to_string(),
            free: exports::FREE.to_string(),
            start: exports::START.to_string(),
            table: exports::TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomPreference {
    /// Use the operating system source if one answers at start-up.
    #[default]
    Auto,
    /// Behave as if no secure source exists.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchBackendKind {
    Network,
    /// Serve only the configured routes.
    #[default]
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub backend: FetchBackendKind,
    pub timeout_ms: u64,
    pub user_agent: String,
    pub routes: Vec<StaticRoute>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            backend: FetchBackendKind::default(),
            timeout_ms: 30_000,
            user_agent: concat!("hostbind/", env!("CARGO_PKG_VERSION")).to_string(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketBackendKind {
    /// Real WebSocket connections over TCP.
    Network,
    /// Echo every message back in-process.
    #[default]
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    pub backend: SocketBackendKind,
    /// How long an idle event loop sleeps between reads of open connections.
    pub poll_interval_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            backend: SocketBackendKind::default(),
            poll_interval_ms: 10,
        }
    }
}

/// A canned response for the static fetch backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub url: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain;charset=UTF-8".to_string()
}
