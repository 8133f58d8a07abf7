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

//! Line-oriented evaluation channel.
//!
//! The child is the environment's interpreter in interactive mode. Every
//! `execute` writes one statement or expression followed by a sentinel
//! print, then reads stdout lines until the sentinel comes back; whatever
//! accumulated in between is the textual result. Bootstrap evaluates the
//! tool's entrypoint with its run-if-main guard armed and lifts the
//! well-known callables into the evaluation scope.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tooldock_core::CallEnvelope;

use super::TransportError;

/// Sentinel printed after every statement to delimit its output.
const EOT: &str = "<<TD_EOT>>";
const EOT_PRINT: &str = "print(\"<<TD_EOT>>\")";

/// Well-known callables the child registers in its host namespace.
const WELL_KNOWN: [&str; 4] = [
    "__td_call__",
    "__td_schema__",
    "__td_methods__",
    "__td_shutdown__",
];

/// Result of one invocation on the textual channel.
#[derive(Debug)]
pub enum EvalReply {
    /// The reply decoded as a call envelope.
    Envelope(CallEnvelope),
    /// The reply was not a JSON envelope; the raw text is surfaced as-is.
    Raw(String),
}

/// A live interactive child speaking the evaluation protocol.
pub struct EvalChannel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl EvalChannel {
    /// Spawn an interactive interpreter from the given environment.
    pub fn spawn(python: &Path) -> Result<Self, TransportError> {
        let mut child = Command::new(python)
            .args(["-u", "-q", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Startup("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Startup("failed to capture stdout".into()))?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Evaluate one line and return its accumulated textual output.
    pub async fn execute(&mut self, code: &str) -> Result<String, TransportError> {
        self.stdin.write_all(code.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.write_all(EOT_PRINT.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let mut out = String::new();
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line).await?;
            if n == 0 {
                return Err(TransportError::ChannelClosed);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == EOT {
                break;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(trimmed);
        }
        Ok(out)
    }

    /// Bootstrap the child service: evaluate the entrypoint with its
    /// run-if-main guard armed, lift the well-known callables into the
    /// top scope, and probe the call entrypoint.
    pub async fn bootstrap(
        &mut self,
        entrypoint: &Path,
        startup_timeout: Duration,
    ) -> Result<(), TransportError> {
        tokio::time::timeout(startup_timeout, self.bootstrap_inner(entrypoint))
            .await
            .map_err(|_| TransportError::Timeout(startup_timeout))?
    }

    async fn bootstrap_inner(&mut self, entrypoint: &Path) -> Result<(), TransportError> {
        let entry = entrypoint.display().to_string();

        // Prompts would interleave with results on some interpreters.
        self.execute(r#"import sys; sys.ps1 = ""; sys.ps2 = """#)
            .await?;

        // Arm the run-if-main guard, then evaluate the program. run()
        // registers the well-known callables in the host namespace.
        self.execute(r#"__name__ = "__main__""#).await?;
        self.execute(&format!(
            "exec(compile(open({entry:?}).read(), {entry:?}, \"exec\"))"
        ))
        .await?;

        // Lift the registered names into the evaluation frame's top scope
        // so subsequent expressions can invoke them directly.
        self.execute("import builtins").await?;
        let names = WELL_KNOWN
            .iter()
            .map(|n| format!("{n:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.execute(&format!(
            "globals().update({{_n: getattr(builtins, _n) for _n in ({names}) if hasattr(builtins, _n)}})"
        ))
        .await?;

        let probe = self
            .execute(r#""ready" if callable(globals().get("__td_call__")) else "not ready""#)
            .await?;
        if !probe.contains("ready") || probe.contains("not ready") {
            return Err(TransportError::Startup(
                "service did not initialize properly: __td_call__ not found".into(),
            ));
        }

        Ok(())
    }

    /// Invoke a method through the call entrypoint.
    pub async fn invoke(
        &mut self,
        method: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<EvalReply, TransportError> {
        let params_json = serde_json::Value::Object(params.clone()).to_string();
        let expr = format!("__td_call__({method:?}, {params_json})");
        let raw = self.execute(&expr).await?;
        Ok(parse_reply(&raw))
    }

    /// Tear the child down: best-effort shutdown call, then kill.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            self.execute("__td_shutdown__() if callable(globals().get(\"__td_shutdown__\")) else None"),
        )
        .await;
        let _ = self.child.kill().await;
    }
}

/// Parse the textual reply of an invocation.
///
/// The evaluator echoes the repr of the returned JSON string, so outer
/// quotes are stripped and common escape pairs undone before decoding.
/// A reply that does not decode as an envelope is surfaced raw rather
/// than treated as an error.
pub fn parse_reply(raw: &str) -> EvalReply {
    let mut text = raw.trim();

    if text.len() >= 2 {
        let bytes = text.as_bytes();
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            text = &text[1..text.len() - 1];
        }
    }

    let unescaped = text.replace("\\'", "'").replace("\\\"", "\"");

    match serde_json::from_str::<CallEnvelope>(&unescaped) {
        Ok(envelope) => EvalReply::Envelope(envelope),
        Err(_) => EvalReply::Raw(raw.to_string()),
    }
}
