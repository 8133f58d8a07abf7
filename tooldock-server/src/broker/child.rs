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

//! Child half of the broker protocol: a serving host registers itself
//! with a broker and heartbeats on the interval the broker hands back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ToolRegistry;

/// Delay between registration attempts while the broker is unreachable.
const REGISTER_RETRY: Duration = Duration::from_secs(10);

pub struct ChildClient {
    broker_url: String,
    self_url: String,
    id: String,
    name: String,
    registry: Arc<ToolRegistry>,
    client: reqwest::Client,
    interval: Mutex<Duration>,
    token: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct RegisterReply {
    #[serde(default)]
    heartbeat_interval: u64,
}

impl ChildClient {
    pub fn new(
        broker_url: String,
        self_url: String,
        name: Option<String>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "host".to_string());
        let id = format!("{}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8], hostname);

        Self {
            broker_url: broker_url.trim_end_matches('/').to_string(),
            self_url,
            id,
            name: name.unwrap_or(hostname),
            registry,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            interval: Mutex::new(Duration::from_secs(30)),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Register with the broker and adopt its heartbeat interval.
    pub async fn register(&self) -> Result<(), reqwest::Error> {
        let body = json!({
            "id": self.id,
            "url": self.self_url,
            "name": self.name,
            "tools": self.registry.names(),
        });

        let reply: RegisterReply = self
            .client
            .post(format!("{}/v1/broker/register", self.broker_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if reply.heartbeat_interval > 0 {
            *self.interval.lock() = Duration::from_secs(reply.heartbeat_interval);
        }

        info!(
            "Registered with broker {} (heartbeat every {:?})",
            self.broker_url,
            *self.interval.lock()
        );
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), reqwest::Error> {
        let body = json!({
            "id": self.id,
            "tools": self.registry.names(),
        });

        self.client
            .post(format!("{}/v1/broker/heartbeat", self.broker_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Run registration and the heartbeat loop until stopped. A failed
    /// heartbeat triggers re-registration.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self;
        let token = client.token.clone();

        tokio::spawn(async move {
            loop {
                match client.register().await {
                    Ok(()) => break,
                    Err(e) => warn!("Broker registration failed: {}", e),
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(REGISTER_RETRY) => {}
                }
            }

            loop {
                let interval = *client.interval.lock();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                if let Err(e) = client.send_heartbeat().await {
                    warn!("Heartbeat failed: {}", e);
                    if let Err(e) = client.register().await {
                        warn!("Re-registration failed: {}", e);
                    }
                }
            }
        })
    }
}
