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

//! The execution engine: process lifetimes and the RPC flow.
//!
//! The public contract is `call(tool, method, params) -> value`; the
//! mode × transport matrix lives behind it. One lock guards the two
//! process tables and the health-supervisor table. At most one entry
//! across both tables exists per tool; `stop` removes it from both.

pub mod eval;
pub mod framed;
pub mod health;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tooldock_core::{CallEnvelope, Mode, Transport};
use tracing::info;

use crate::envs::EnvHandle;
use crate::registry::{RegistryError, Tool, ToolRegistry};
use eval::{EvalChannel, EvalReply};
use framed::FramedChannel;

/// Per-call timeout on the framed transport.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("tool {0} is not running, start it first")]
    NotRunning(String),

    #[error("tool {0} is already running")]
    AlreadyRunning(String),

    #[error("tool {0} is not a persistent tool")]
    WrongMode(String),

    /// The child returned `ok: false`; the message is the child's
    /// `type: message` plus traceback. The host does not interpret it.
    #[error("{0}")]
    Tool(String),

    #[error("failed to ensure environment: {0}")]
    Environment(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct HealthTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Tables {
    eval: HashMap<String, Arc<Mutex<EvalChannel>>>,
    framed: HashMap<String, Arc<Mutex<FramedChannel>>>,
    health: HashMap<String, HealthTask>,
}

/// The executor is a cheap handle: the process tables are shared behind
/// one lock, so clones observe the same state. Health supervisors hold
/// their own clone.
#[derive(Clone)]
pub struct Executor {
    pub(crate) registry: Arc<ToolRegistry>,
    tables: Arc<RwLock<Tables>>,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }

    /// Execute a method on a tool.
    pub async fn call(
        &self,
        tool_name: &str,
        method_name: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ExecutorError::ToolNotFound(tool_name.to_string()))?;

        if !tool.manifest.rpc.methods.contains_key(method_name) {
            return Err(ExecutorError::MethodNotFound(method_name.to_string()));
        }

        let env = self.registry.ensure_environment(tool_name).await?;

        let runtime = &tool.manifest.runtime;
        match (runtime.mode, runtime.transport) {
            (Mode::Oneshot, Transport::Eval) => {
                self.call_oneshot_eval(&tool, &env, method_name, &params).await
            }
            (Mode::Oneshot, Transport::Framed) => {
                self.call_oneshot_framed(&tool, &env, method_name, &params)
                    .await
            }
            (Mode::Persistent, Transport::Eval) => {
                self.call_persistent_eval(&tool.name, method_name, &params)
                    .await
            }
            (Mode::Persistent, Transport::Framed) => {
                self.call_persistent_framed(&tool.name, method_name, &params)
                    .await
            }
        }
    }

    async fn call_oneshot_eval(
        &self,
        tool: &Tool,
        env: &EnvHandle,
        method: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let mut channel = EvalChannel::spawn(&env.python())?;
        let entrypoint = tool.path.join(&tool.manifest.runtime.entrypoint);
        let startup = Duration::from_secs(tool.manifest.runtime.startup_timeout);

        let outcome = async {
            channel.bootstrap(&entrypoint, startup).await?;
            let reply = channel.invoke(method, params).await?;
            eval_reply_to_value(reply)
        }
        .await;

        channel.close().await;
        outcome
    }

    async fn call_oneshot_framed(
        &self,
        tool: &Tool,
        env: &EnvHandle,
        method: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let entrypoint = tool.path.join(&tool.manifest.runtime.entrypoint);
        let mut channel = FramedChannel::spawn(&env.python(), &entrypoint, &tool.path)?;

        let outcome = async {
            let envelope = channel.call(method, params, CALL_TIMEOUT).await?;
            unwrap_envelope(envelope)
        }
        .await;

        channel.close().await;
        outcome
    }

    async fn call_persistent_eval(
        &self,
        tool_name: &str,
        method: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let channel = self
            .tables
            .read()
            .eval
            .get(tool_name)
            .cloned()
            .ok_or_else(|| ExecutorError::NotRunning(tool_name.to_string()))?;

        let reply = channel.lock().await.invoke(method, params).await?;
        eval_reply_to_value(reply)
    }

    async fn call_persistent_framed(
        &self,
        tool_name: &str,
        method: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let channel = self
            .tables
            .read()
            .framed
            .get(tool_name)
            .cloned()
            .ok_or_else(|| ExecutorError::NotRunning(tool_name.to_string()))?;

        let envelope = channel.lock().await.call(method, params, CALL_TIMEOUT).await?;
        unwrap_envelope(envelope)
    }

    /// Start the shared child of a persistent tool.
    pub async fn start(&self, tool_name: &str) -> Result<(), ExecutorError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ExecutorError::ToolNotFound(tool_name.to_string()))?;

        if tool.manifest.runtime.mode != Mode::Persistent {
            return Err(ExecutorError::WrongMode(tool_name.to_string()));
        }

        if self.is_running(tool_name) {
            return Err(ExecutorError::AlreadyRunning(tool_name.to_string()));
        }

        let env = self.registry.ensure_environment(tool_name).await?;

        match tool.manifest.runtime.transport {
            Transport::Eval => self.start_eval(&tool, &env).await?,
            Transport::Framed => self.start_framed(&tool, &env).await?,
        }

        self.registry.set_started(tool_name);

        if let Some(health) = tool.manifest.health.clone() {
            let token = CancellationToken::new();
            let handle = tokio::spawn(health::run_supervisor(
                self.clone(),
                tool_name.to_string(),
                health,
                token.clone(),
            ));
            self.tables
                .write()
                .health
                .insert(tool_name.to_string(), HealthTask { token, handle });
        }

        info!("Started {} ({})", tool_name, tool.manifest.runtime.transport);
        Ok(())
    }

    async fn start_eval(&self, tool: &Tool, env: &EnvHandle) -> Result<(), ExecutorError> {
        let mut channel = EvalChannel::spawn(&env.python())?;
        let entrypoint = tool.path.join(&tool.manifest.runtime.entrypoint);
        let startup = Duration::from_secs(tool.manifest.runtime.startup_timeout);

        if let Err(e) = channel.bootstrap(&entrypoint, startup).await {
            channel.close().await;
            return Err(e.into());
        }

        self.insert_eval(&tool.name, channel).await
    }

    async fn start_framed(&self, tool: &Tool, env: &EnvHandle) -> Result<(), ExecutorError> {
        let entrypoint = tool.path.join(&tool.manifest.runtime.entrypoint);
        let channel = FramedChannel::spawn(&env.python(), &entrypoint, &tool.path)?;

        let arc = Arc::new(Mutex::new(channel));
        let clashed = {
            let mut tables = self.tables.write();
            if tables.eval.contains_key(&tool.name) || tables.framed.contains_key(&tool.name) {
                true
            } else {
                tables.framed.insert(tool.name.clone(), arc.clone());
                false
            }
        };
        if clashed {
            arc.lock().await.close().await;
            return Err(ExecutorError::AlreadyRunning(tool.name.clone()));
        }
        Ok(())
    }

    async fn insert_eval(&self, name: &str, channel: EvalChannel) -> Result<(), ExecutorError> {
        let arc = Arc::new(Mutex::new(channel));
        let clashed = {
            let mut tables = self.tables.write();
            if tables.eval.contains_key(name) || tables.framed.contains_key(name) {
                true
            } else {
                tables.eval.insert(name.to_string(), arc.clone());
                false
            }
        };
        if clashed {
            arc.lock().await.close().await;
            return Err(ExecutorError::AlreadyRunning(name.to_string()));
        }
        Ok(())
    }

    /// Stop a running tool: cancel its supervisor, wait for it to exit,
    /// then tear the child down.
    pub async fn stop(&self, tool_name: &str) -> Result<(), ExecutorError> {
        if self.registry.get(tool_name).is_none() {
            return Err(ExecutorError::ToolNotFound(tool_name.to_string()));
        }

        let task = self.tables.write().health.remove(tool_name);
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }

        let (eval_channel, framed_channel) = {
            let mut tables = self.tables.write();
            (
                tables.eval.remove(tool_name),
                tables.framed.remove(tool_name),
            )
        };

        if let Some(channel) = eval_channel {
            channel.lock().await.close().await;
            self.registry.set_stopped(tool_name);
            info!("Stopped {} (eval)", tool_name);
            return Ok(());
        }

        if let Some(channel) = framed_channel {
            channel.lock().await.close().await;
            self.registry.set_stopped(tool_name);
            info!("Stopped {} (framed)", tool_name);
            return Ok(());
        }

        Err(ExecutorError::NotRunning(tool_name.to_string()))
    }

    /// Stop all running tools and supervisors.
    pub async fn close(&self) {
        let (health, eval, framed) = {
            let mut tables = self.tables.write();
            (
                std::mem::take(&mut tables.health),
                std::mem::take(&mut tables.eval),
                std::mem::take(&mut tables.framed),
            )
        };

        for (_, task) in health {
            task.token.cancel();
            let _ = task.handle.await;
        }
        for (name, channel) in eval {
            channel.lock().await.close().await;
            self.registry.set_stopped(&name);
        }
        for (name, channel) in framed {
            channel.lock().await.close().await;
            self.registry.set_stopped(&name);
        }
    }

    /// Whether a tool holds an entry in either process table.
    pub fn is_running(&self, tool_name: &str) -> bool {
        let tables = self.tables.read();
        tables.eval.contains_key(tool_name) || tables.framed.contains_key(tool_name)
    }

    /// Invoke a method with empty parameters on an already-running tool,
    /// via whichever transport it holds. Used by health supervisors.
    pub(crate) async fn health_call(
        &self,
        tool_name: &str,
        method: &str,
    ) -> Result<serde_json::Value, ExecutorError> {
        let empty = serde_json::Map::new();

        let eval_channel = self.tables.read().eval.get(tool_name).cloned();
        if let Some(channel) = eval_channel {
            let reply = channel.lock().await.invoke(method, &empty).await?;
            return eval_reply_to_value(reply);
        }

        let framed_channel = self.tables.read().framed.get(tool_name).cloned();
        if let Some(channel) = framed_channel {
            let envelope = channel.lock().await.call(method, &empty, CALL_TIMEOUT).await?;
            return unwrap_envelope(envelope);
        }

        Err(ExecutorError::NotRunning(tool_name.to_string()))
    }
}

/// Unpack an envelope into its result value or a tool error.
fn unwrap_envelope(envelope: CallEnvelope) -> Result<serde_json::Value, ExecutorError> {
    if envelope.ok {
        return Ok(envelope.result.unwrap_or(serde_json::Value::Null));
    }
    match envelope.error {
        Some(error) => Err(ExecutorError::Tool(error.render())),
        None => Err(ExecutorError::Tool(
            "call failed with unknown error".to_string(),
        )),
    }
}

fn eval_reply_to_value(reply: EvalReply) -> Result<serde_json::Value, ExecutorError> {
    match reply {
        EvalReply::Envelope(envelope) => unwrap_envelope(envelope),
        EvalReply::Raw(text) => Ok(serde_json::Value::String(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envs::EnvProvisioner;
    use tempfile::TempDir;
    use tooldock_core::{CallError, MANIFEST_FILENAME};

    fn executor_with(state: &TempDir, manifests: &[(&str, &str)]) -> Arc<Executor> {
        let tools = state.path().join("tools");
        for (name, text) in manifests {
            let dir = tools.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(MANIFEST_FILENAME), text).unwrap();
        }
        let provisioner = Arc::new(EnvProvisioner::new(state.path().join("envs")));
        let registry = Arc::new(ToolRegistry::new(
            tools,
            state.path().join("run"),
            provisioner,
        ));
        registry.scan().unwrap();
        Arc::new(Executor::new(registry))
    }

    #[tokio::test]
    async fn call_unknown_tool_fails() {
        let state = TempDir::new().unwrap();
        let executor = executor_with(&state, &[]);
        let err = executor
            .call("ghost", "m", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn call_unknown_method_fails() {
        let state = TempDir::new().unwrap();
        let executor = executor_with(
            &state,
            &[("calc", "name: calc\nrpc:\n  methods:\n    add:\n      description: add\n")],
        );
        let err = executor
            .call("calc", "multiply", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn start_oneshot_tool_is_wrong_mode() {
        let state = TempDir::new().unwrap();
        let executor = executor_with(&state, &[("calc", "name: calc\n")]);
        let err = executor.start("calc").await.unwrap_err();
        assert!(matches!(err, ExecutorError::WrongMode(_)));
    }

    #[tokio::test]
    async fn call_persistent_tool_before_start_is_not_running() {
        let state = TempDir::new().unwrap();
        let manifest = "name: svc\nruntime:\n  mode: persistent\nrpc:\n  methods:\n    ping:\n      description: ping\n";
        let executor = executor_with(&state, &[("svc", manifest)]);
        // Pre-create the env so ensure_environment does not provision.
        std::fs::create_dir_all(state.path().join("envs").join("tool-svc")).unwrap();

        let err = executor
            .call("svc", "ping", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotRunning(_)));
    }

    #[tokio::test]
    async fn stop_when_not_running_fails() {
        let state = TempDir::new().unwrap();
        let executor = executor_with(&state, &[("svc", "name: svc\nruntime:\n  mode: persistent\n")]);
        let err = executor.stop("svc").await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotRunning(_)));
        assert!(!executor.is_running("svc"));
    }

    #[test]
    fn unwrap_envelope_ok_returns_result() {
        let envelope = CallEnvelope {
            ok: true,
            result: Some(serde_json::json!(5)),
            error: None,
            done: true,
            chunk: None,
        };
        assert_eq!(unwrap_envelope(envelope).unwrap(), serde_json::json!(5));
    }

    #[test]
    fn unwrap_envelope_ok_without_result_is_null() {
        let envelope = CallEnvelope {
            ok: true,
            result: None,
            error: None,
            done: true,
            chunk: None,
        };
        assert_eq!(unwrap_envelope(envelope).unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn unwrap_envelope_error_renders_type_and_message() {
        let envelope = CallEnvelope {
            ok: false,
            result: None,
            error: Some(CallError {
                kind: "ValueError".into(),
                message: "bad input".into(),
                traceback: None,
            }),
            done: true,
            chunk: None,
        };
        let err = unwrap_envelope(envelope).unwrap_err();
        assert_eq!(err.to_string(), "ValueError: bad input");
    }

    #[test]
    fn raw_reply_becomes_string_value() {
        let value = eval_reply_to_value(EvalReply::Raw("plain text".into())).unwrap();
        assert_eq!(value, serde_json::json!("plain text"));
    }
}
