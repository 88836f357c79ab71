use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use res_node::api::Api;
use res_node::config::NodeConfig;
use res_node::store::Store;

#[derive(Debug, Parser)]
#[command(name = "res_node", about = "remote script execution service")]
struct Args {
    /// Root folder for the image and job stores. Overrides the config.
    #[arg(long)]
    store: Option<PathBuf>,
    /// Port for the HTTP API to listen on. Overrides the config.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut cfg = NodeConfig::load_with_env()?;
    if let Some(store_root) = args.store {
        cfg.store_root = store_root;
    }
    if let Some(port) = args.port {
        cfg.api_port = port;
    }

    let store = Store::open(&cfg.store_root)?;
    let api = Api::new(store, &cfg);
    api.serve(SocketAddr::new(cfg.api_host, cfg.api_port)).await
}
