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

//! Request broker for distributed tooldock hosts.
//!
//! The broker owns no tools. Children register with their tool lists and
//! heartbeat; the broker keeps a reverse index from tool name to the
//! single child currently claiming it (last registration wins) and
//! proxies tool requests to the owner. One lock guards the children map
//! and the reverse index.

pub mod child;
pub mod routes;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    Healthy,
    Unhealthy,
    Dead,
}

/// A registered downstream host.
#[derive(Debug, Clone, Serialize)]
pub struct ChildServer {
    pub id: String,
    pub url: String,
    pub name: String,
    pub tools: Vec<String>,
    pub registered_at: u64,
    pub last_heartbeat: u64,
    pub status: ChildStatus,
}

/// A tool entry aggregated from a child, annotated with its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerToolInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
}

#[derive(Default)]
struct BrokerState {
    children: HashMap<String, ChildServer>,
    tool_index: HashMap<String, String>,
}

pub struct Broker {
    state: RwLock<BrokerState>,
    /// Client for child aggregation calls.
    list_client: reqwest::Client,
    /// Client for proxied tool requests; long timeout to cover
    /// model-load methods.
    proxy_client: reqwest::Client,
    heartbeat_timeout: Duration,
    cleanup_interval: Duration,
    token: CancellationToken,
}

impl Broker {
    pub fn new(heartbeat_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            list_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            proxy_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .expect("reqwest client"),
            heartbeat_timeout,
            cleanup_interval,
            token: CancellationToken::new(),
        }
    }

    /// Interval children should heartbeat at, half the timeout.
    pub fn heartbeat_interval_secs(&self) -> u64 {
        (self.heartbeat_timeout.as_secs() / 2).max(1)
    }

    /// Add or update a child and write its tools into the reverse index.
    pub fn register(&self, id: String, url: String, name: String, tools: Vec<String>) {
        let now = unix_now();
        let mut state = self.state.write();

        for tool in &tools {
            state.tool_index.insert(tool.clone(), id.clone());
        }

        let count = tools.len();
        state.children.insert(
            id.clone(),
            ChildServer {
                id,
                url: url.clone(),
                name: name.clone(),
                tools,
                registered_at: now,
                last_heartbeat: now,
                status: ChildStatus::Healthy,
            },
        );

        info!("Registered child server: {} ({}) with {} tools", name, url, count);
    }

    /// Refresh a child's heartbeat. A supplied tool list replaces the
    /// child's claims and re-indexes them.
    pub fn heartbeat(&self, id: &str, tools: Option<Vec<String>>) -> bool {
        let mut state = self.state.write();

        if !state.children.contains_key(id) {
            return false;
        }

        if let Some(tools) = tools {
            let old: Vec<String> = state.children[id].tools.clone();
            for tool in old {
                if state.tool_index.get(&tool).map(String::as_str) == Some(id) {
                    state.tool_index.remove(&tool);
                }
            }
            for tool in &tools {
                state.tool_index.insert(tool.clone(), id.to_string());
            }
            if let Some(entry) = state.children.get_mut(id) {
                entry.tools = tools;
            }
        }

        if let Some(entry) = state.children.get_mut(id) {
            entry.last_heartbeat = unix_now();
            entry.status = ChildStatus::Healthy;
        }
        true
    }

    pub fn children(&self) -> Vec<ChildServer> {
        self.state.read().children.values().cloned().collect()
    }

    /// Resolve the healthy owner of a tool.
    pub fn child_for_tool(&self, tool: &str) -> Option<ChildServer> {
        let state = self.state.read();
        let child_id = state.tool_index.get(tool)?;
        let child = state.children.get(child_id)?;
        if child.status != ChildStatus::Healthy {
            return None;
        }
        Some(child.clone())
    }

    /// One cleanup sweep at the given time: a silent child turns
    /// unhealthy after the timeout and is removed after three timeouts.
    pub fn cleanup_once(&self, now: u64) {
        let timeout = self.heartbeat_timeout.as_secs();
        let mut state = self.state.write();

        let mut dead: Vec<String> = Vec::new();
        for (id, child) in state.children.iter_mut() {
            let silent_for = now.saturating_sub(child.last_heartbeat);
            if silent_for <= timeout {
                continue;
            }
            if child.status == ChildStatus::Healthy {
                child.status = ChildStatus::Unhealthy;
                warn!("Child server {} marked unhealthy (no heartbeat)", child.name);
            } else if silent_for > timeout * 3 {
                child.status = ChildStatus::Dead;
                dead.push(id.clone());
            }
        }

        for id in dead {
            if let Some(child) = state.children.remove(&id) {
                for tool in &child.tools {
                    if state.tool_index.get(tool).map(String::as_str) == Some(id.as_str()) {
                        state.tool_index.remove(tool);
                    }
                }
                warn!("Child server {} removed (dead)", child.name);
            }
        }
    }

    /// Start the periodic cleanup task.
    pub fn spawn_cleanup(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = self;
        let token = broker.token.clone();
        let interval = broker.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                broker.cleanup_once(unix_now());
            }
        })
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    /// Aggregate `/v1/tools` from every healthy child, annotating each
    /// entry with its origin. Per-child failures are logged and skipped.
    pub async fn list_tools(&self) -> Vec<BrokerToolInfo> {
        let healthy: Vec<ChildServer> = self
            .state
            .read()
            .children
            .values()
            .filter(|c| c.status == ChildStatus::Healthy)
            .cloned()
            .collect();

        let mut all = Vec::new();
        for child in healthy {
            match self.fetch_tools(&child).await {
                Ok(mut tools) => {
                    for tool in &mut tools {
                        tool.server_id = child.id.clone();
                        tool.server_name = child.name.clone();
                    }
                    all.extend(tools);
                }
                Err(e) => {
                    warn!("Failed to fetch tools from {}: {}", child.name, e);
                }
            }
        }
        all
    }

    async fn fetch_tools(&self, child: &ChildServer) -> Result<Vec<BrokerToolInfo>, reqwest::Error> {
        let response = self
            .list_client
            .get(format!("{}/v1/tools", child.url))
            .send()
            .await?
            .error_for_status()?;
        let tools = response.json().await?;
        debug!("Fetched tools from {}", child.name);
        Ok(tools)
    }

    pub(crate) fn proxy_client(&self) -> &reqwest::Client {
        &self.proxy_client
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> Broker {
        Broker::new(Duration::from_secs(60), Duration::from_secs(30))
    }

    #[test]
    fn register_indexes_tools() {
        let b = broker();
        b.register(
            "c1".into(),
            "http://h1:9801".into(),
            "host-1".into(),
            vec!["w".into(), "x".into()],
        );

        let child = b.child_for_tool("w").unwrap();
        assert_eq!(child.id, "c1");
        assert_eq!(child.status, ChildStatus::Healthy);
        assert!(b.child_for_tool("missing").is_none());
    }

    #[test]
    fn last_registration_wins_the_index() {
        let b = broker();
        b.register("c1".into(), "http://h1".into(), "h1".into(), vec!["w".into()]);
        b.register("c2".into(), "http://h2".into(), "h2".into(), vec!["w".into()]);
        assert_eq!(b.child_for_tool("w").unwrap().id, "c2");
    }

    #[test]
    fn heartbeat_refreshes_and_can_update_tools() {
        let b = broker();
        b.register("c1".into(), "http://h1".into(), "h1".into(), vec!["old".into()]);

        assert!(b.heartbeat("c1", Some(vec!["new".into()])));
        assert!(b.child_for_tool("old").is_none());
        assert_eq!(b.child_for_tool("new").unwrap().id, "c1");

        // Repeating the same heartbeat is a no-op with respect to state.
        assert!(b.heartbeat("c1", Some(vec!["new".into()])));
        assert_eq!(b.child_for_tool("new").unwrap().id, "c1");
        assert_eq!(b.children().len(), 1);

        assert!(!b.heartbeat("ghost", None));
    }

    #[test]
    fn cleanup_marks_then_removes_silent_children() {
        let b = broker();
        b.register("c1".into(), "http://h1".into(), "h1".into(), vec!["w".into()]);
        let registered = b.children()[0].last_heartbeat;

        // Within the timeout nothing changes.
        b.cleanup_once(registered + 30);
        assert_eq!(b.children()[0].status, ChildStatus::Healthy);

        // Past the timeout the child turns unhealthy and stops routing.
        b.cleanup_once(registered + 61);
        assert_eq!(b.children()[0].status, ChildStatus::Unhealthy);
        assert!(b.child_for_tool("w").is_none());

        // Past three timeouts it is removed with its index entries.
        b.cleanup_once(registered + 181);
        assert!(b.children().is_empty());
        assert!(b.child_for_tool("w").is_none());
    }

    #[test]
    fn heartbeat_revives_an_unhealthy_child() {
        let b = broker();
        b.register("c1".into(), "http://h1".into(), "h1".into(), vec!["w".into()]);
        let registered = b.children()[0].last_heartbeat;

        b.cleanup_once(registered + 61);
        assert_eq!(b.children()[0].status, ChildStatus::Unhealthy);

        assert!(b.heartbeat("c1", None));
        assert_eq!(b.children()[0].status, ChildStatus::Healthy);
        assert!(b.child_for_tool("w").is_some());
    }

    #[test]
    fn removal_keeps_index_entries_claimed_by_others() {
        let b = broker();
        b.register("c1".into(), "http://h1".into(), "h1".into(), vec!["w".into()]);
        b.register("c2".into(), "http://h2".into(), "h2".into(), vec!["w".into()]);
        let t0 = b.children().iter().map(|c| c.last_heartbeat).max().unwrap();

        // c1 goes silent while c2 recovers. The index belongs to c2 and
        // must survive c1's removal.
        b.cleanup_once(t0 + 61);
        b.heartbeat("c2", None);
        b.cleanup_once(t0 + 181);

        assert_eq!(b.children().len(), 1);
        assert_eq!(b.children()[0].id, "c2");

        b.heartbeat("c2", None);
        assert_eq!(b.child_for_tool("w").unwrap().id, "c2");
    }

    #[test]
    fn heartbeat_interval_is_half_the_timeout() {
        let b = broker();
        assert_eq!(b.heartbeat_interval_secs(), 30);
    }
}
