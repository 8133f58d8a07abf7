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

//! The response envelope every child call returns.
//!
//! Both transports produce the same shape: `{ok, result?, error?, done,
//! chunk?}`. `done` is always true in-band today; `chunk` is reserved for
//! chunked delivery and must deserialize without being acted on.

use serde::{Deserialize, Serialize};

/// Standard response object returned by every child call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<serde_json::Value>,
}

/// Error payload carried by a failed call. The host does not interpret
/// `kind`; it is the child's exception type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl CallError {
    /// Render as `type: message`, appending the traceback when present.
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.message);
        if let Some(tb) = &self.traceback {
            if !tb.is_empty() {
                out.push('\n');
                out.push_str(tb);
            }
        }
        out
    }
}
