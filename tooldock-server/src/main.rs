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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tooldock_server::config::Config;
use tooldock_server::envs::EnvProvisioner;
use tooldock_server::registry::ToolRegistry;
use tooldock_server::ServeOptions;

#[derive(Parser, Debug)]
#[command(name = "tooldock", version, about = "Serve Python tools over an HTTP/JSON RPC surface")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API server
    Serve {
        /// HTTP listen address (overrides config file)
        #[arg(long, env = "TOOLDOCK_LISTEN_ADDR")]
        listen_addr: Option<String>,

        /// State root directory (overrides config file)
        #[arg(long, env = "TOOLDOCK_STATE_ROOT")]
        state_root: Option<PathBuf>,

        /// Bearer credential required on every request
        #[arg(long, env = "TOOLDOCK_AUTH_TOKEN")]
        auth_token: Option<String>,

        /// File store directory (default: the state root)
        #[arg(long)]
        store_path: Option<PathBuf>,

        /// Disable the durable file store
        #[arg(long)]
        no_store: bool,

        /// Broker to register with (child mode)
        #[arg(long)]
        broker_url: Option<String>,

        /// Public base URL advertised to the broker
        #[arg(long)]
        advertise_url: Option<String>,

        /// Human-readable name reported to the broker
        #[arg(long)]
        name: Option<String>,
    },

    /// Start a broker that aggregates child servers
    Broker {
        /// HTTP listen address (overrides config file)
        #[arg(long, env = "TOOLDOCK_LISTEN_ADDR")]
        listen_addr: Option<String>,
    },

    /// Install a tool from a git URL or local path
    Install {
        /// Git URL or local directory containing a tooldock.yaml
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tooldock_server::init_tracing();

    let mut config = Config::load(args.config)?;

    match args.command {
        Command::Serve {
            listen_addr,
            state_root,
            auth_token,
            store_path,
            no_store,
            broker_url,
            advertise_url,
            name,
        } => {
            if let Some(addr) = listen_addr {
                config.server.listen_addr = addr;
            }
            if let Some(root) = state_root {
                config.state.root = root;
            }
            if let Some(token) = auth_token {
                config.auth.token = Some(token);
            }

            let opts = ServeOptions {
                store_path,
                store_disable: no_store,
                broker_url,
                advertise_url,
                server_name: name,
            };
            tooldock_server::run_server(config, opts).await
        }

        Command::Broker { listen_addr } => {
            if let Some(addr) = listen_addr {
                config.server.listen_addr = addr;
            }
            tooldock_server::run_broker(config).await
        }

        Command::Install { source } => {
            config.ensure_dirs()?;
            let provisioner = Arc::new(EnvProvisioner::new(config.envs_dir()));
            let registry = ToolRegistry::new(config.tools_dir(), config.run_dir(), provisioner);
            registry.scan()?;

            let tool = registry.install(&source).await?;
            println!("Installed {} v{}", tool.name, tool.manifest.version);
            Ok(())
        }
    }
}
