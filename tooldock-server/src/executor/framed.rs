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

//! Framed binary message channel.
//!
//! Frame format over the child's stdio:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte
//! prefix. One request frame per call, one reply frame back; the child
//! registers its method handlers at start time using the framing library
//! shipped with its environment.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tooldock_core::{CallEnvelope, CallError};

use super::TransportError;

/// Message type: request to the child.
pub const MSG_REQUEST: u8 = 0x01;
/// Message type: reply from the child.
pub const MSG_RESPONSE: u8 = 0x02;

/// Maximum accepted payload size.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct FramedRequest<'a> {
    id: u64,
    method: &'a str,
    params: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FramedResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<CallError>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    chunk: Option<serde_json::Value>,
}

impl From<FramedResponse> for CallEnvelope {
    fn from(r: FramedResponse) -> Self {
        CallEnvelope {
            ok: r.ok,
            result: r.result,
            error: r.error,
            done: r.done,
            chunk: r.chunk,
        }
    }
}

/// A live child speaking the framed protocol over its stdio.
pub struct FramedChannel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl FramedChannel {
    /// Spawn the tool's entrypoint program in its environment.
    pub fn spawn(python: &Path, entrypoint: &Path, tool_dir: &Path) -> Result<Self, TransportError> {
        let mut child = Command::new(python)
            .arg("-u")
            .arg(entrypoint)
            .current_dir(tool_dir)
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
            next_id: 1,
        })
    }

    /// Send one request frame and read one reply frame, bounded by the
    /// per-call timeout.
    pub async fn call(
        &mut self,
        method: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        timeout: Duration,
    ) -> Result<CallEnvelope, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = FramedRequest { id, method, params };
        let payload = rmp_serde::to_vec_named(&request)?;

        tokio::time::timeout(timeout, async {
            write_frame(&mut self.stdin, MSG_REQUEST, &payload).await?;

            let (msg_type, reply) = read_frame(&mut self.stdout, MAX_FRAME_BYTES)
                .await?
                .ok_or(TransportError::ChannelClosed)?;
            if msg_type != MSG_RESPONSE {
                return Err(TransportError::Protocol(format!(
                    "unexpected message type {msg_type:#04x}"
                )));
            }

            let response: FramedResponse = rmp_serde::from_slice(&reply)?;
            if response.id != id {
                return Err(TransportError::Protocol(format!(
                    "reply id mismatch: expected {id}, got {}",
                    response.id
                )));
            }

            Ok(CallEnvelope::from(response))
        })
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
    }

    /// Tear the child down.
    pub async fn close(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Read one frame from the stream.
///
/// Returns `(msg_type, payload_bytes)`, or `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<(u8, Vec<u8>)>, TransportError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(TransportError::Protocol(format!(
            "frame too large: {frame_len} bytes"
        )));
    }
    if frame_len < 1 {
        return Err(TransportError::Protocol(
            "frame too short: missing type byte".into(),
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let msg_type = frame_data[0];
    let payload = frame_data[1..].to_vec();

    Ok(Some((msg_type, payload)))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> Result<(), TransportError> {
    let frame_len = 1u32 + payload.len() as u32;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[msg_type]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
