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

pub mod api;
pub mod broker;
pub mod config;
pub mod envs;
pub mod executor;
pub mod files;
pub mod filestore;
pub mod registry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use broker::child::ChildClient;
use broker::Broker;
use config::Config;
use envs::EnvProvisioner;
use executor::Executor;
use files::OutputManager;
use filestore::Store;
use registry::ToolRegistry;

/// Options for a serving host.
#[derive(Debug, Default)]
pub struct ServeOptions {
    /// Custom base directory for the file store (default: the state root).
    pub store_path: Option<PathBuf>,
    /// Disable the file store entirely.
    pub store_disable: bool,
    /// Broker to register with; enables child mode.
    pub broker_url: Option<String>,
    /// Public base URL advertised to the broker.
    pub advertise_url: Option<String>,
    /// Human-readable name reported to the broker.
    pub server_name: Option<String>,
}

/// Initialize the tracing subscriber once per process.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tooldock_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the shared application state: scan the tools root, wire the
/// executor, the legacy output manager, and the durable store.
pub fn build_state(config: Config, opts: &ServeOptions) -> Result<AppState> {
    config.ensure_dirs()?;

    let provisioner = Arc::new(EnvProvisioner::new(config.envs_dir()));
    let registry = Arc::new(ToolRegistry::new(
        config.tools_dir(),
        config.run_dir(),
        provisioner,
    ));
    let loaded = registry.scan()?;
    info!("Loaded {} tools from {:?}", loaded, config.tools_dir());

    let executor = Arc::new(Executor::new(registry.clone()));
    let outputs = Arc::new(OutputManager::new(
        config.uploads_dir(),
        config.outputs_dir(),
    )?);

    let store = if opts.store_disable {
        info!("File store disabled");
        None
    } else {
        let base = opts
            .store_path
            .clone()
            .unwrap_or_else(|| config.state.root.clone());
        match Store::new(&base) {
            Ok(store) => {
                info!("File store initialized at {:?}", base);
                Some(Arc::new(store))
            }
            Err(e) => {
                warn!("Failed to create file store at {:?}: {}", base, e);
                None
            }
        }
    };

    Ok(AppState {
        config: Arc::new(config),
        registry,
        executor,
        outputs,
        store,
    })
}

/// Run a serving host until interrupted.
pub async fn run_server(config: Config, opts: ServeOptions) -> Result<()> {
    let addr = config.socket_addr()?;
    let state = build_state(config, &opts)?;

    if let Some(store) = &state.store {
        let _ = store.clone().spawn_gc();
    }

    let child_client = opts.broker_url.as_ref().map(|broker_url| {
        let advertise = opts
            .advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{addr}"));
        let client = Arc::new(ChildClient::new(
            broker_url.clone(),
            advertise,
            opts.server_name.clone(),
            state.registry.clone(),
        ));
        let _ = client.clone().spawn();
        client
    });

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("tooldock API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(client) = child_client {
        client.stop();
    }
    state.executor.close().await;
    if let Some(store) = &state.store {
        store.close();
    }

    Ok(())
}

/// Run a broker until interrupted.
pub async fn run_broker(config: Config) -> Result<()> {
    let addr = config.socket_addr()?;

    let broker = Arc::new(Broker::new(
        Duration::from_secs(config.broker.heartbeat_timeout_secs),
        Duration::from_secs(config.broker.cleanup_interval_secs),
    ));
    let _ = broker.clone().spawn_cleanup();

    let app = broker::routes::router(broker.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("tooldock broker listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    broker.close();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
}
