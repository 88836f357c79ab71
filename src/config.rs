use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Name of the optional config file looked up in the working directory.
pub(crate) const CONFIG_FILE_NAME: &str = "res.config.toml";

/// Prefix for environment overrides, e.g. `RES_API_PORT=8080` sets
/// `NodeConfig.api_port`.
pub(crate) const ENV_PREFIX: &str = "RES";

/// The configuration for a script-execution node.
#[derive(PartialEq, Eq, Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the HTTP API binds to.
    pub api_host: IpAddr,
    /// Port number for the HTTP API to listen on.
    pub api_port: u16,
    /// Root folder holding the image and job stores.
    pub store_root: PathBuf,
    /// Container runtime binary invoked per job run.
    pub runtime: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            api_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            api_port: 8017,
            store_root: PathBuf::from(".store"),
            runtime: "apptainer".to_string(),
        }
    }
}

impl NodeConfig {
    /// Resolve the effective config: defaults, overridden by the config
    /// file when one exists in the working directory, overridden by
    /// `RES_*` environment variables.
    pub fn load_with_env() -> Result<Self> {
        Self::load(Path::new(CONFIG_FILE_NAME), ENV_PREFIX)
    }

    fn load(file: &Path, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if file.exists() {
            let path = file
                .to_str()
                .ok_or_else(|| anyhow!("config path is not valid utf-8"))?;
            builder = builder.add_source(File::with_name(path));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        trace!("resolved config: {:#?}", cfg);
        Ok(cfg.try_deserialize()?)
    }
}
