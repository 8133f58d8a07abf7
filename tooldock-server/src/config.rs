// Copyright 2025 Tooldock (https://github.com/tooldock)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Tooldock host configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: HttpConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// HTTP API listen address (e.g., "127.0.0.1:9800").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    /// Per-user state root holding tools/, envs/, run/, uploads/,
    /// outputs/, blobs/ and files.db.
    #[serde(default = "default_state_root")]
    pub root: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            root: default_state_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Optional shared bearer credential. When set, every request must
    /// present it.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Seconds without a heartbeat before a child is marked unhealthy.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Seconds between cleanup sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:9800".to_string()
}

fn default_state_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tooldock")
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: HttpConfig::default(),
            state: StateConfig::default(),
            auth: AuthConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - TOOLDOCK_LISTEN_ADDR: HTTP listen address
    /// - TOOLDOCK_STATE_ROOT: state root directory
    /// - TOOLDOCK_AUTH_TOKEN: bearer credential
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TOOLDOCK_LISTEN_ADDR") {
            config.server.listen_addr = addr;
        }
        if let Ok(root) = std::env::var("TOOLDOCK_STATE_ROOT") {
            config.state.root = PathBuf::from(root);
        }
        if let Ok(token) = std::env::var("TOOLDOCK_AUTH_TOKEN") {
            if !token.is_empty() {
                config.auth.token = Some(token);
            }
        }

        config
    }

    /// Load configuration with priority: file > env > defaults.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            let default_path = default_state_root().join("config.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config = Self::merge_with_env(config);
        Ok(config)
    }

    /// Merge config with environment variables (env takes priority).
    fn merge_with_env(mut config: Self) -> Self {
        let env_config = Self::from_env();

        if std::env::var("TOOLDOCK_LISTEN_ADDR").is_ok() {
            config.server.listen_addr = env_config.server.listen_addr;
        }
        if std::env::var("TOOLDOCK_STATE_ROOT").is_ok() {
            config.state.root = env_config.state.root;
        }
        if std::env::var("TOOLDOCK_AUTH_TOKEN").is_ok() {
            config.auth.token = env_config.auth.token;
        }

        config
    }

    /// Parse the listen address as a SocketAddr.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.state.root.join("tools")
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.state.root.join("envs")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.state.root.join("run")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.state.root.join("uploads")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.state.root.join("outputs")
    }

    /// Create the on-disk state layout.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.tools_dir(),
            self.envs_dir(),
            self.run_dir(),
            self.uploads_dir(),
            self.outputs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9800");
        assert!(config.auth.token.is_none());
        assert_eq!(config.broker.heartbeat_timeout_secs, 60);
        assert!(config.state.root.ends_with(".tooldock"));
    }

    #[test]
    fn derived_dirs() {
        let mut config = Config::default();
        config.state.root = PathBuf::from("/tmp/td");
        assert_eq!(config.tools_dir(), PathBuf::from("/tmp/td/tools"));
        assert_eq!(config.envs_dir(), PathBuf::from("/tmp/td/envs"));
        assert_eq!(config.outputs_dir(), PathBuf::from("/tmp/td/outputs"));
    }

    #[test]
    fn from_toml() {
        let text = r#"
[server]
listen_addr = "0.0.0.0:9900"

[auth]
token = "secret"

[broker]
heartbeat_timeout_secs = 10
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9900");
        assert_eq!(config.auth.token.as_deref(), Some("secret"));
        assert_eq!(config.broker.heartbeat_timeout_secs, 10);
        assert_eq!(config.broker.cleanup_interval_secs, 30);
    }

    #[test]
    fn socket_addr_parses() {
        let config = Config::default();
        assert!(config.socket_addr().is_ok());
    }
}
