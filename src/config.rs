use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{DepError, Result};
use crate::global::utils::{DEFAULT_CACHE_DIR, get_global_config_dir};

/// Name of the configuration file inside the global config directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Settings read from `config.toml`. Command line flags override them.
///
/// ```toml
/// cache_dir = "~/.up/cache"
///
/// [registry]
/// timeout_secs = 30
/// insecure_skip_tls_verify = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// How the registry client talks to OCI registries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound for every registry request.
    pub timeout_secs: u64,
    /// Accept any TLS certificate. Only for test registries.
    pub insecure_skip_tls_verify: bool,
    /// Bearer token sent to registries instead of the anonymous token flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            insecure_skip_tls_verify: false,
            token: None,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Loads a `Config` from a file path.
    ///
    /// # Errors
    /// Returns an error if the file can't be read or deserialized.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DepError::InvalidConfig(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| DepError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Loads the global `config.toml`, or defaults when there is none.
    pub fn load_or_default() -> Result<Config> {
        let path = get_global_config_dir()?.join(CONFIG_FILE);
        if path.exists() {
            Config::load(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Saves the `Config` to the given file path in pretty TOML format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| DepError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| DepError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// The configured cache root, unexpanded.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
    }
}
