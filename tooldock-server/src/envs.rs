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

//! Environment provisioning.
//!
//! Each tool runs inside an isolated Python virtual environment rooted
//! under `{state}/envs`, keyed by a deterministic name derived from the
//! tool name. Creation is delegated to `uv` when available, otherwise to
//! the host's `python3 -m venv`. Dependency installation only happens
//! when the environment was created by the current call.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tooldock_core::Manifest;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("failed to create environment {name}: {detail}")]
    CreateFailed { name: String, detail: String },

    #[error("failed to install {what}: {detail}")]
    InstallFailed { what: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to a provisioned environment on disk. Opaque to everything but
/// the executor, which only needs the interpreter path.
#[derive(Debug, Clone)]
pub struct EnvHandle {
    pub name: String,
    pub root: PathBuf,
}

impl EnvHandle {
    /// Path to the environment's interpreter.
    pub fn python(&self) -> PathBuf {
        self.root.join("bin").join("python")
    }
}

/// Creates and reuses isolated Python environments.
pub struct EnvProvisioner {
    envs_dir: PathBuf,
}

impl EnvProvisioner {
    pub fn new(envs_dir: PathBuf) -> Self {
        Self { envs_dir }
    }

    /// Ensure an environment exists for the manifest.
    ///
    /// Returns the handle and whether the environment was created by this
    /// call. Existing environments are reused as-is; the caller installs
    /// dependencies exactly when `fresh` is true.
    pub async fn ensure(&self, manifest: &Manifest) -> Result<(EnvHandle, bool), EnvError> {
        let name = format!("tool-{}", manifest.name);
        let root = self.envs_dir.join(&name);
        let handle = EnvHandle {
            name: name.clone(),
            root: root.clone(),
        };

        if root.exists() {
            return Ok((handle, false));
        }

        info!(
            "Creating Python {} environment for {}",
            if manifest.runtime.python.is_empty() {
                "(default)"
            } else {
                &manifest.runtime.python
            },
            manifest.name
        );

        if let Err(err) = self.create(&root, &manifest.runtime.python).await {
            // A half-created environment would be reused as-is next time.
            let _ = std::fs::remove_dir_all(&root);
            return Err(err);
        }

        Ok((handle, true))
    }

    async fn create(&self, root: &Path, python_version: &str) -> Result<(), EnvError> {
        std::fs::create_dir_all(&self.envs_dir)?;

        let mut uv = Command::new("uv");
        uv.arg("venv").arg(root);
        if !python_version.is_empty() {
            uv.args(["--python", python_version]);
        }

        match run(&mut uv).await {
            Ok(()) => return Ok(()),
            Err(CommandError::Missing) => {
                if !python_version.is_empty() {
                    warn!(
                        "uv not found; creating venv with host python3 (version pin {} ignored)",
                        python_version
                    );
                }
            }
            Err(CommandError::Failed(detail)) => {
                return Err(EnvError::CreateFailed {
                    name: root.display().to_string(),
                    detail,
                })
            }
        }

        let mut venv = Command::new("python3");
        venv.args(["-m", "venv"]).arg(root);
        run(&mut venv).await.map_err(|e| EnvError::CreateFailed {
            name: root.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Install the manifest's declared dependencies into a fresh
    /// environment: system-level packages first, one at a time, then
    /// language-level packages in bulk, then a requirements file if the
    /// tool ships one.
    pub async fn install_dependencies(
        &self,
        handle: &EnvHandle,
        manifest: &Manifest,
        tool_dir: &Path,
    ) -> Result<(), EnvError> {
        let runtime = &manifest.runtime;

        for pkg in &runtime.system_packages {
            info!("Installing system package {} into {}", pkg, handle.name);
            self.pip(handle, &[pkg.as_str()]).await.map_err(|detail| {
                EnvError::InstallFailed {
                    what: pkg.clone(),
                    detail,
                }
            })?;
        }

        if !runtime.packages.is_empty() {
            info!(
                "Installing packages {:?} into {}",
                runtime.packages, handle.name
            );
            let args: Vec<&str> = runtime.packages.iter().map(String::as_str).collect();
            self.pip(handle, &args).await.map_err(|detail| {
                EnvError::InstallFailed {
                    what: runtime.packages.join(", "),
                    detail,
                }
            })?;
        }

        if let Some(requirements) = &runtime.requirements {
            let req_path = tool_dir.join(requirements);
            if req_path.exists() {
                info!("Installing from {}", requirements);
                let req = req_path.display().to_string();
                self.pip(handle, &["-r", &req]).await.map_err(|detail| {
                    EnvError::InstallFailed {
                        what: requirements.clone(),
                        detail,
                    }
                })?;
            }
        }

        Ok(())
    }

    async fn pip(&self, handle: &EnvHandle, args: &[&str]) -> Result<(), String> {
        let mut cmd = Command::new(handle.python());
        cmd.args(["-m", "pip", "install"]).args(args);
        run(&mut cmd).await.map_err(|e| e.to_string())
    }
}

enum CommandError {
    /// The executable was not found on PATH.
    Missing,
    Failed(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Missing => f.write_str("executable not found"),
            CommandError::Failed(detail) => f.write_str(detail),
        }
    }
}

async fn run(cmd: &mut Command) -> Result<(), CommandError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CommandError::Missing,
            _ => CommandError::Failed(e.to_string()),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CommandError::Failed(format!(
            "exit {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tooldock_core::Manifest;

    #[test]
    fn handle_resolves_interpreter() {
        let handle = EnvHandle {
            name: "tool-x".into(),
            root: PathBuf::from("/envs/tool-x"),
        };
        assert_eq!(handle.python(), PathBuf::from("/envs/tool-x/bin/python"));
    }

    #[tokio::test]
    async fn existing_environment_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = EnvProvisioner::new(dir.path().to_path_buf());

        let manifest = Manifest::from_yaml("name: calc\n").unwrap();
        std::fs::create_dir_all(dir.path().join("tool-calc")).unwrap();

        let (handle, fresh) = provisioner.ensure(&manifest).await.unwrap();
        assert!(!fresh);
        assert_eq!(handle.name, "tool-calc");
        assert_eq!(handle.root, dir.path().join("tool-calc"));
    }
}
