use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::server::ServerTarget;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuStatConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            default_interval_secs: default_interval_secs(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub key_path: String,
    /// Overrides `settings.default_interval_secs` for this server
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_interval_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_port() -> u16 {
    22
}

impl GpuStatConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            servers = config.servers.len(),
            "Loaded config"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(invalid("no servers configured"));
        }
        if self.settings.default_interval_secs == 0 {
            return Err(invalid("settings.default_interval_secs must be > 0"));
        }
        if self.settings.max_retries == 0 {
            return Err(invalid("settings.max_retries must be > 0"));
        }
        if self.settings.connect_timeout_secs == 0 {
            return Err(invalid("settings.connect_timeout_secs must be > 0"));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            validate_name(&server.name)?;
            if !names.insert(server.name.as_str()) {
                return Err(invalid(format!("duplicate server name '{}'", server.name)));
            }
            if server.host.trim().is_empty() {
                return Err(invalid(format!("server '{}' has an empty host", server.name)));
            }
            if server.user.trim().is_empty() {
                return Err(invalid(format!("server '{}' has an empty user", server.name)));
            }
            if server.interval_secs == Some(0) {
                return Err(invalid(format!("server '{}' has interval_secs = 0", server.name)));
            }
        }
        Ok(())
    }

    /// Resolve every configured server into a `ServerTarget`
    pub fn targets(&self) -> Vec<ServerTarget> {
        self.servers
            .iter()
            .map(|server| ServerTarget {
                name: server.name.clone(),
                host: server.host.clone(),
                user: server.user.clone(),
                port: server.port,
                key_path: expand_home(&server.key_path),
                poll_interval: Duration::from_secs(
                    server
                        .interval_secs
                        .unwrap_or(self.settings.default_interval_secs),
                ),
            })
            .collect()
    }
}

/// Server names become directory names under the data dir
fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(invalid("server name must not be empty"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(invalid(format!(
            "server name '{}' is not usable as a directory name",
            name
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(path);
    };

    if path == "~" {
        return home;
    }
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}
