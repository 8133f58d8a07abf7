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

//! Per-tool health supervision.
//!
//! Each supervisor is bound to a cancellation token created at Start and
//! cancelled before the child is torn down. It never tears the child
//! down on its own; `unhealthy` is surfaced for caller policy.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tooldock_core::Health;
use tracing::{debug, info, warn};

use super::Executor;
use crate::registry::HealthStatus;

/// Delay before the first check, giving the child time to settle.
const INITIAL_DELAY: Duration = Duration::from_secs(2);

/// A response is healthy iff it is `{"status": "ok", ...}` or the
/// literal string `"ok"`.
pub fn is_healthy_reply(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            map.get("status").and_then(|v| v.as_str()) == Some("ok")
        }
        serde_json::Value::String(s) => s == "ok",
        _ => false,
    }
}

/// Supervisor loop for one tool. Exits when the token is cancelled.
pub async fn run_supervisor(
    executor: Executor,
    tool: String,
    health: Health,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(INITIAL_DELAY) => {}
    }

    let interval = Duration::from_secs(health.interval.max(1));

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let healthy = match executor.health_call(&tool, &health.method).await {
            Ok(value) => is_healthy_reply(&value),
            Err(e) => {
                debug!("Health call failed for {}: {}", tool, e);
                false
            }
        };

        match executor
            .registry
            .record_health(&tool, healthy, health.failure_threshold)
        {
            Some(HealthStatus::Unhealthy) => {
                warn!(
                    "Health check failed for {} ({} consecutive failures)",
                    tool, health.failure_threshold
                );
            }
            Some(HealthStatus::Healthy) => {
                info!("Health check passed for {}", tool);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_status_ok_is_healthy() {
        assert!(is_healthy_reply(&serde_json::json!({"status": "ok"})));
        assert!(is_healthy_reply(
            &serde_json::json!({"status": "ok", "detail": "warm"})
        ));
    }

    #[test]
    fn plain_ok_string_is_healthy() {
        assert!(is_healthy_reply(&serde_json::json!("ok")));
    }

    #[test]
    fn everything_else_is_unhealthy() {
        assert!(!is_healthy_reply(&serde_json::json!({"status": "down"})));
        assert!(!is_healthy_reply(&serde_json::json!("nope")));
        assert!(!is_healthy_reply(&serde_json::json!(null)));
        assert!(!is_healthy_reply(&serde_json::json!(200)));
        assert!(!is_healthy_reply(&serde_json::json!({"ok": true})));
    }
}
