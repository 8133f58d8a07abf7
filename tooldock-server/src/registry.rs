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

//! Tool registry.
//!
//! Installs tools from local directories or git URLs, scans the tools
//! root on startup, and keeps the in-memory catalogue of installed tools
//! plus their lifecycle and health state. One lock guards the tool map;
//! readers get cloned snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tooldock_core::{Manifest, ManifestError, Method, Mode, MANIFEST_FILENAME};
use tracing::{info, warn};

use crate::envs::{EnvError, EnvHandle, EnvProvisioner};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool {name} already installed at {path}")]
    AlreadyInstalled { name: String, path: PathBuf },

    #[error("no tooldock.yaml found at {0}")]
    ManifestMissing(PathBuf),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("git clone failed for {url}: {detail}")]
    GitClone { url: String, detail: String },

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// An installed tool and its runtime state.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub path: PathBuf,
    pub manifest: Arc<Manifest>,
    pub env: Option<EnvHandle>,
    pub status: ToolStatus,
    pub health: Option<HealthStatus>,
    pub health_failures: u32,
}

impl Tool {
    fn new(name: String, path: PathBuf, manifest: Arc<Manifest>, env: Option<EnvHandle>) -> Self {
        Self {
            name,
            path,
            manifest,
            env,
            status: ToolStatus::Stopped,
            health: None,
            health_failures: 0,
        }
    }
}

/// Summary view for tool listings.
#[derive(Debug, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub mode: Mode,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    pub methods: Vec<String>,
}

/// Detailed view: like the summary, but with the full methods map.
#[derive(Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub mode: Mode,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    pub methods: HashMap<String, Method>,
}

pub struct ToolRegistry {
    tools_dir: PathBuf,
    run_dir: PathBuf,
    provisioner: Arc<EnvProvisioner>,
    tools: RwLock<HashMap<String, Tool>>,
}

impl ToolRegistry {
    pub fn new(tools_dir: PathBuf, run_dir: PathBuf, provisioner: Arc<EnvProvisioner>) -> Self {
        Self {
            tools_dir,
            run_dir,
            provisioner,
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Scan the tools root and load every manifest found. Entries are
    /// independent: a bad tool is logged and skipped.
    pub fn scan(&self) -> std::io::Result<usize> {
        let entries = match std::fs::read_dir(&self.tools_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut loaded = 0;
        for entry in entries {
            let entry = entry?;
            let tool_path = entry.path();

            // Follow symlinks.
            let Ok(meta) = std::fs::metadata(&tool_path) else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }

            let manifest = match Manifest::load(&tool_path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("failed to load {}: {}", tool_path.display(), e);
                    continue;
                }
            };

            let name = manifest.name.clone();
            self.tools.write().insert(
                name.clone(),
                Tool::new(name, tool_path, Arc::new(manifest), None),
            );
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Install a tool from a local path or a git URL.
    pub async fn install(&self, source: &str) -> Result<Tool, RegistryError> {
        std::fs::create_dir_all(&self.tools_dir)?;

        let (tool_path, manifest) = if is_local_source(source) {
            self.materialise_local(source)?
        } else {
            self.materialise_git(source).await?
        };

        let manifest = Arc::new(manifest);
        let name = manifest.name.clone();

        // Provision and, on a fresh environment, install the declared
        // dependencies. Any failure past this point removes the
        // materialised directory so install stays idempotent.
        let env = match self.provision(&manifest, &tool_path).await {
            Ok(env) => env,
            Err(e) => {
                remove_materialised(&tool_path);
                return Err(e);
            }
        };

        let tool = Tool::new(name.clone(), tool_path, manifest.clone(), Some(env));
        self.tools.write().insert(name.clone(), tool.clone());

        info!("Installed {} v{}", name, manifest.version);
        Ok(tool)
    }

    async fn provision(
        &self,
        manifest: &Manifest,
        tool_path: &Path,
    ) -> Result<EnvHandle, RegistryError> {
        let (env, fresh) = self.provisioner.ensure(manifest).await?;
        if fresh {
            self.provisioner
                .install_dependencies(&env, manifest, tool_path)
                .await?;
        }
        Ok(env)
    }

    /// Symlink a local tool into the tools root.
    fn materialise_local(&self, source: &str) -> Result<(PathBuf, Manifest), RegistryError> {
        let source = expand_home(source);
        let abs_source = std::fs::canonicalize(&source)?;

        if !abs_source.join(MANIFEST_FILENAME).exists() {
            return Err(RegistryError::ManifestMissing(abs_source));
        }

        let manifest = Manifest::load(&abs_source)?;
        self.check_not_installed(&manifest.name)?;

        let tool_path = self.tools_dir.join(&manifest.name);
        remove_materialised(&tool_path);
        std::os::unix::fs::symlink(&abs_source, &tool_path)?;

        Ok((tool_path, manifest))
    }

    /// Shallow-clone a remote tool into a temp dir, then move it into
    /// the tools root under its manifest name.
    async fn materialise_git(&self, source: &str) -> Result<(PathBuf, Manifest), RegistryError> {
        let url = normalize_git_url(source);

        std::fs::create_dir_all(&self.run_dir)?;
        let temp = self
            .run_dir
            .join(format!("install-{}", uuid::Uuid::new_v4().simple()));

        info!("Cloning {}...", url);
        let output = Command::new("git")
            .args(["clone", "--depth", "1", &url])
            .arg(&temp)
            .output()
            .await?;
        if !output.status.success() {
            let _ = std::fs::remove_dir_all(&temp);
            return Err(RegistryError::GitClone {
                url,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let manifest = match Manifest::load(&temp) {
            Ok(m) => m,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&temp);
                return Err(e.into());
            }
        };

        if let Err(e) = self.check_not_installed(&manifest.name) {
            let _ = std::fs::remove_dir_all(&temp);
            return Err(e);
        }

        let tool_path = self.tools_dir.join(&manifest.name);
        remove_materialised(&tool_path);
        if let Err(e) = std::fs::rename(&temp, &tool_path) {
            let _ = std::fs::remove_dir_all(&temp);
            return Err(e.into());
        }

        Ok((tool_path, manifest))
    }

    fn check_not_installed(&self, name: &str) -> Result<(), RegistryError> {
        if let Some(existing) = self.tools.read().get(name) {
            return Err(RegistryError::AlreadyInstalled {
                name: name.to_string(),
                path: existing.path.clone(),
            });
        }
        Ok(())
    }

    /// Load or create the environment for an installed tool, installing
    /// dependencies when the environment is fresh. The handle is cached
    /// on the tool entry.
    pub async fn ensure_environment(&self, name: &str) -> Result<EnvHandle, RegistryError> {
        let (manifest, path, existing) = {
            let tools = self.tools.read();
            let tool = tools
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            (tool.manifest.clone(), tool.path.clone(), tool.env.clone())
        };

        if let Some(env) = existing {
            return Ok(env);
        }

        let env = self.provision(&manifest, &path).await?;

        if let Some(tool) = self.tools.write().get_mut(name) {
            tool.env = Some(env.clone());
        }
        Ok(env)
    }

    pub fn get(&self, name: &str) -> Option<Tool> {
        self.tools.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.tools.read().len()
    }

    pub fn list(&self) -> Vec<ToolSummary> {
        self.tools
            .read()
            .values()
            .map(|t| ToolSummary {
                name: t.name.clone(),
                version: t.manifest.version.clone(),
                description: t.manifest.description.clone(),
                capabilities: t.manifest.capabilities.clone(),
                mode: t.manifest.runtime.mode,
                status: t.status,
                health_status: t.health,
                methods: t.manifest.rpc.methods.keys().cloned().collect(),
            })
            .collect()
    }

    pub fn info(&self, name: &str) -> Option<ToolInfo> {
        let tools = self.tools.read();
        let t = tools.get(name)?;
        Some(ToolInfo {
            name: t.name.clone(),
            version: t.manifest.version.clone(),
            description: t.manifest.description.clone(),
            capabilities: t.manifest.capabilities.clone(),
            mode: t.manifest.runtime.mode,
            status: t.status,
            health_status: t.health,
            methods: t.manifest.rpc.methods.clone(),
        })
    }

    /// Mark a tool running with unknown health.
    pub fn set_started(&self, name: &str) {
        if let Some(tool) = self.tools.write().get_mut(name) {
            tool.status = ToolStatus::Running;
            tool.health = Some(HealthStatus::Unknown);
            tool.health_failures = 0;
        }
    }

    /// Mark a tool stopped and clear its health state.
    pub fn set_stopped(&self, name: &str) {
        if let Some(tool) = self.tools.write().get_mut(name) {
            tool.status = ToolStatus::Stopped;
            tool.health = None;
            tool.health_failures = 0;
        }
    }

    /// Record one health check outcome. Returns the new status when the
    /// observation caused a transition.
    pub fn record_health(
        &self,
        name: &str,
        healthy: bool,
        threshold: u32,
    ) -> Option<HealthStatus> {
        let mut tools = self.tools.write();
        let tool = tools.get_mut(name)?;

        if healthy {
            tool.health_failures = 0;
            if tool.health != Some(HealthStatus::Healthy) {
                tool.health = Some(HealthStatus::Healthy);
                return Some(HealthStatus::Healthy);
            }
            return None;
        }

        tool.health_failures += 1;
        if tool.health_failures >= threshold && tool.health != Some(HealthStatus::Unhealthy) {
            tool.health = Some(HealthStatus::Unhealthy);
            return Some(HealthStatus::Unhealthy);
        }
        None
    }
}

fn is_local_source(source: &str) -> bool {
    source.starts_with('/')
        || source.starts_with("./")
        || source.starts_with("../")
        || source.starts_with('~')
}

fn expand_home(source: &str) -> PathBuf {
    if let Some(rest) = source.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(source)
}

fn normalize_git_url(source: &str) -> String {
    if source.starts_with("https://") || source.starts_with("git@") {
        return source.to_string();
    }
    let mut url = format!("https://{source}");
    if !url.contains(".git") {
        url.push_str(".git");
    }
    url
}

/// Remove a materialised tool entry: the symlink itself for linked
/// installs, the whole tree for cloned ones.
fn remove_materialised(path: &Path) {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let _ = std::fs::remove_file(path);
        }
        Ok(_) => {
            let _ = std::fs::remove_dir_all(path);
        }
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, text: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILENAME), text).unwrap();
    }

    fn registry(state: &TempDir) -> ToolRegistry {
        let provisioner = Arc::new(EnvProvisioner::new(state.path().join("envs")));
        ToolRegistry::new(
            state.path().join("tools"),
            state.path().join("run"),
            provisioner,
        )
    }

    #[test]
    fn scan_loads_manifests_and_skips_bad_entries() {
        let state = TempDir::new().unwrap();
        let tools = state.path().join("tools");
        write_manifest(&tools.join("calc"), "name: calc\nversion: '1.0'\n");
        write_manifest(&tools.join("broken"), ": not yaml ::\n");
        std::fs::write(tools.join("stray-file"), "ignored").unwrap();

        let reg = registry(&state);
        assert_eq!(reg.scan().unwrap(), 1);
        assert!(reg.get("calc").is_some());
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn scan_follows_symlinked_tools() {
        let state = TempDir::new().unwrap();
        let source = state.path().join("src-tool");
        write_manifest(&source, "name: linked\n");

        let tools = state.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        std::os::unix::fs::symlink(&source, tools.join("linked")).unwrap();

        let reg = registry(&state);
        assert_eq!(reg.scan().unwrap(), 1);
        assert!(reg.get("linked").is_some());
    }

    #[tokio::test]
    async fn install_local_symlinks_and_rejects_duplicates() {
        let state = TempDir::new().unwrap();
        let source = state.path().join("mytool");
        write_manifest(&source, "name: mytool\nversion: '0.1'\n");
        // Pre-create the env root so provisioning reuses it.
        std::fs::create_dir_all(state.path().join("envs").join("tool-mytool")).unwrap();

        let reg = registry(&state);
        std::fs::create_dir_all(state.path().join("tools")).unwrap();

        let tool = reg.install(source.to_str().unwrap()).await.unwrap();
        assert_eq!(tool.name, "mytool");
        assert_eq!(tool.status, ToolStatus::Stopped);
        let link = state.path().join("tools").join("mytool");
        assert!(std::fs::symlink_metadata(&link)
            .unwrap()
            .file_type()
            .is_symlink());

        let err = reg.install(source.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyInstalled { .. }));
    }

    #[tokio::test]
    async fn install_local_without_manifest_fails() {
        let state = TempDir::new().unwrap();
        let source = state.path().join("empty");
        std::fs::create_dir_all(&source).unwrap();

        let reg = registry(&state);
        let err = reg.install(source.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestMissing(_)));
    }

    #[test]
    fn health_transitions_respect_threshold() {
        let state = TempDir::new().unwrap();
        let tools = state.path().join("tools");
        write_manifest(&tools.join("svc"), "name: svc\n");
        let reg = registry(&state);
        reg.scan().unwrap();
        reg.set_started("svc");
        assert_eq!(reg.get("svc").unwrap().health, Some(HealthStatus::Unknown));

        // Two failures below the threshold keep the status unchanged.
        assert_eq!(reg.record_health("svc", false, 3), None);
        assert_eq!(reg.record_health("svc", false, 3), None);
        assert_eq!(reg.get("svc").unwrap().health_failures, 2);

        // Third failure crosses it.
        assert_eq!(
            reg.record_health("svc", false, 3),
            Some(HealthStatus::Unhealthy)
        );
        // Repeated failures do not re-report the transition.
        assert_eq!(reg.record_health("svc", false, 3), None);

        // One healthy response resets everything.
        assert_eq!(
            reg.record_health("svc", true, 3),
            Some(HealthStatus::Healthy)
        );
        assert_eq!(reg.get("svc").unwrap().health_failures, 0);

        reg.set_stopped("svc");
        let tool = reg.get("svc").unwrap();
        assert_eq!(tool.status, ToolStatus::Stopped);
        assert_eq!(tool.health, None);
    }

    #[test]
    fn git_url_normalization() {
        assert_eq!(
            normalize_git_url("github.com/acme/tool"),
            "https://github.com/acme/tool.git"
        );
        assert_eq!(
            normalize_git_url("https://github.com/acme/tool.git"),
            "https://github.com/acme/tool.git"
        );
        assert_eq!(
            normalize_git_url("git@github.com:acme/tool.git"),
            "git@github.com:acme/tool.git"
        );
    }

    #[test]
    fn local_source_detection() {
        assert!(is_local_source("/abs/path"));
        assert!(is_local_source("./rel"));
        assert!(is_local_source("../rel"));
        assert!(is_local_source("~/home"));
        assert!(!is_local_source("github.com/acme/tool"));
    }
}
