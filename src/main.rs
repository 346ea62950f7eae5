use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use grove_server::config::{ChannelConfig, DEFAULT_CONFIG_PATH};
use grove_server::db::MemoryStore;
use grove_server::script::ScriptManagers;
use grove_server::ChannelServer;

#[derive(Parser)]
#[command(name = "grove-channel", about = "A channel server for grove")]
struct Args {
    /// Path to the channel configuration.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Root of the static resource tree.
    #[arg(long, default_value = "wz")]
    data: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match ChannelConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e:#}");
            return ExitCode::from(255);
        }
    };

    let data = match grove_data::GameData::load(&args.data) {
        Ok(data) => Arc::new(data),
        Err(e) => {
            error!("failed to load static data: {e:#}");
            return ExitCode::from(255);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the runtime: {e}");
            return ExitCode::from(255);
        }
    };

    runtime.block_on(async move {
        let store = Arc::new(MemoryStore::new());
        let managers = Arc::new(ScriptManagers::table_driven());
        let server = match ChannelServer::bind(config, data, store, managers).await {
            Ok(server) => server,
            Err(e) => {
                error!("failed to start: {e:#}");
                return ExitCode::from(255);
            }
        };

        match server.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("server stopped: {e:#}");
                ExitCode::from(255)
            }
        }
    })
}
