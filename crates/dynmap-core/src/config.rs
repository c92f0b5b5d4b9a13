//! Shared configuration defaults and loading.
//!
//! Constants live in small modules so that every crate refers to the same
//! tokens and environment variable names. [`GatewayConfig`] is loaded from a
//! TOML file and may be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Reserved tokens used in topics and substitution paths.
pub mod tokens {
    /// Separator between topic levels.
    pub const TOPIC_SEPARATOR: &str = "/";
    /// Matches exactly one topic level.
    pub const TOPIC_WILDCARD_SINGLE: &str = "+";
    /// Matches any number of trailing topic levels.
    pub const TOPIC_WILDCARD_MULTI: &str = "#";
    /// Root of a JSON document in a substitution path.
    pub const ROOT_PATH: &str = "$";
    /// Pseudo object holding the device identity of a message.
    pub const IDENTITY: &str = "_IDENTITY_";
    /// Payload property carrying the topic levels of the inbound message.
    pub const TOPIC_LEVEL: &str = "_TOPIC_LEVEL_";
    /// Device identity path when an external id is used.
    pub const IDENTITY_EXTERNAL_ID: &str = "_IDENTITY_.externalId";
    /// Device identity path when the internal id is used directly.
    pub const IDENTITY_SOURCE_ID: &str = "_IDENTITY_.c8ySourceId";
}

/// Default values.
pub mod defaults {
    /// Tenant used when none is configured.
    pub const TENANT: &str = "default";
    /// Deepest JSON path the built-in extractor will follow.
    pub const MAX_PATH_DEPTH: usize = 32;
    /// Default configuration file name.
    pub const CONFIG_FILE: &str = "dynmap.toml";
    /// Largest array length `CREATE_IF_MISSING` may grow a template array to.
    pub const MAX_ARRAY_LEN: usize = 10_000;
}

/// Environment variable names.
pub mod env_vars {
    pub const TENANT: &str = "DYNMAP_TENANT";
    pub const LOG_PAYLOAD: &str = "DYNMAP_LOG_PAYLOAD";
    pub const MAX_PATH_DEPTH: &str = "DYNMAP_MAX_PATH_DEPTH";
    pub const LOG_JSON: &str = "DYNMAP_LOG_JSON";

    /// Read a variable and parse it, ignoring unset or malformed values.
    pub fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }
}

/// Runtime configuration of the mapping gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Tenant whose mapping tree is used when a caller does not name one.
    pub tenant: String,
    /// Log inbound payloads and produced documents at info level.
    pub log_payload: bool,
    /// Deepest JSON path the built-in extractor will follow.
    pub max_path_depth: usize,
    /// Reject documents whose external device id cannot be resolved, even when
    /// the mapping allows implicit device creation.
    pub fail_on_unknown_device: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tenant: defaults::TENANT.to_string(),
            log_payload: false,
            max_path_depth: defaults::MAX_PATH_DEPTH,
            fail_on_unknown_device: false,
        }
    }
}

impl GatewayConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        info!(category = "config", "Loading config from: {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults. Environment
    /// overrides are applied in both cases.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None if Path::new(defaults::CONFIG_FILE).exists() => {
                Self::load(defaults::CONFIG_FILE)?
            }
            None => {
                debug!(category = "config", "No config file, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.check()?;
        Ok(config)
    }

    /// Override fields from `DYNMAP_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(tenant) = std::env::var(env_vars::TENANT) {
            if !tenant.trim().is_empty() {
                self.tenant = tenant.trim().to_string();
            }
        }
        if let Some(log_payload) = env_vars::parsed::<bool>(env_vars::LOG_PAYLOAD) {
            self.log_payload = log_payload;
        }
        match env_vars::parsed::<usize>(env_vars::MAX_PATH_DEPTH) {
            Some(depth) => self.max_path_depth = depth,
            None if std::env::var(env_vars::MAX_PATH_DEPTH).is_ok() => {
                warn!(
                    category = "config",
                    "Ignoring malformed {}", env_vars::MAX_PATH_DEPTH
                );
            }
            None => {}
        }
    }

    fn check(&self) -> Result<()> {
        if self.tenant.trim().is_empty() {
            return Err(crate::config_err!("tenant must not be empty"));
        }
        if self.max_path_depth == 0 {
            return Err(crate::config_err!("max_path_depth must be at least 1"));
        }
        Ok(())
    }
}
