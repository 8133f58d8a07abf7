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

//! Tool manifest parsing.
//!
//! Every installed tool carries a `tooldock.yaml` at its root describing
//! identity, runtime requirements, RPC methods, and an optional health
//! policy. Unknown fields are ignored so manifests can carry extra
//! metadata without breaking older hosts.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Manifest filename expected at the root of every tool directory.
pub const MANIFEST_FILENAME: &str = "tooldock.yaml";

/// Schema type tag that triggers upload handling on input and
/// reference-wrapping on output.
pub const FILE_TYPE: &str = "file";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// A parsed `tooldock.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub health: Option<Health>,
}

impl Manifest {
    /// Parse a manifest from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load `tooldock.yaml` from a tool directory.
    pub fn load(tool_dir: &Path) -> Result<Self, ManifestError> {
        let path = tool_dir.join(MANIFEST_FILENAME);
        let text = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }
}

/// Runtime requirements: interpreter version, dependencies, process mode,
/// and RPC transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    /// Python version spec, e.g. "3.11".
    #[serde(default)]
    pub python: String,

    /// Language-level packages, installed in bulk into a fresh environment.
    #[serde(default)]
    pub packages: Vec<String>,

    /// System-level packages, installed one at a time before `packages`.
    #[serde(default)]
    pub system_packages: Vec<String>,

    /// Optional requirements file, relative to the tool directory.
    #[serde(default)]
    pub requirements: Option<String>,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub transport: Transport,

    /// Entrypoint program, relative to the tool directory.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    /// Seconds allowed for the child to reach a callable bootstrap.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            python: String::new(),
            packages: Vec::new(),
            system_packages: Vec::new(),
            requirements: None,
            mode: Mode::default(),
            transport: Transport::default(),
            entrypoint: default_entrypoint(),
            startup_timeout: default_startup_timeout(),
        }
    }
}

fn default_entrypoint() -> String {
    "main.py".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

/// Process lifetime policy for a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fresh child per call.
    #[default]
    Oneshot,
    /// Shared long-lived child, created by Start.
    Persistent,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Oneshot => f.write_str("oneshot"),
            Mode::Persistent => f.write_str("persistent"),
        }
    }
}

/// RPC transport a tool's child speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Line-oriented evaluation channel.
    #[default]
    Eval,
    /// Length-prefixed binary message channel.
    Framed,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Eval => f.write_str("eval"),
            Transport::Framed => f.write_str("framed"),
        }
    }
}

/// Informational resource hints. The host records these but does not
/// schedule on them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub vram_gb: u32,
    #[serde(default)]
    pub ram_gb: u32,
}

/// The tool's RPC interface: a map from method name to descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rpc {
    #[serde(default)]
    pub methods: HashMap<String, Method>,
}

/// A single RPC method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Method {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Schema>,
}

impl Method {
    /// Names of top-level input fields declared with `type: file`.
    pub fn input_file_fields(&self) -> Vec<&str> {
        file_fields(self.input.as_ref())
    }

    /// Names of top-level output fields declared with `type: file`.
    pub fn output_file_fields(&self) -> Vec<&str> {
        file_fields(self.output.as_ref())
    }
}

fn file_fields(schema: Option<&Schema>) -> Vec<&str> {
    let Some(props) = schema.and_then(|s| s.properties.as_ref()) else {
        return Vec::new();
    };
    props
        .iter()
        .filter(|(_, prop)| prop.kind.as_deref() == Some(FILE_TYPE))
        .map(|(name, _)| name.as_str())
        .collect()
}

/// A simplified JSON-Schema tree. The `file` type tag is a host-level
/// extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, Schema>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Health check policy for a persistent tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Method invoked with empty parameters on every tick.
    pub method: String,
    /// Seconds between checks.
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    /// Consecutive failures before the tool is marked unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}
