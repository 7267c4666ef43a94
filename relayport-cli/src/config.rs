use std::path::Path;

use anyhow::{Context, Result};
use ::config::{Config, Environment, File, Map};
use serde::Deserialize;

pub const DEFAULT_LOCAL_PORT: u16 = 3000;
pub const DEFAULT_SERVER_IP: &str = "dfanso.dev";
pub const DEFAULT_SERVER_PORT: u16 = 8080;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "RELAYPORT";

/// Defaults offered by `relayport start`.
///
/// Layered lowest to highest: built-in defaults, `config.toml` in the
/// config directory, then `RELAYPORT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub local_port: u16,
    #[serde(default)]
    pub subdomain: Option<String>,
    pub server_ip: String,
    pub server_port: u16,
    #[serde(default)]
    pub insecure_ws: bool,
}

impl Settings {
    pub fn load(config_dir: Option<&Path>) -> Result<Self> {
        Self::load_with_env(config_dir, None)
    }

    fn load_with_env(config_dir: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("local_port", DEFAULT_LOCAL_PORT)?
            .set_default("server_ip", DEFAULT_SERVER_IP)?
            .set_default("server_port", DEFAULT_SERVER_PORT)?
            .set_default("insecure_ws", false)?;

        if let Some(dir) = config_dir {
            let path = dir.join(CONFIG_FILE);
            tracing::debug!("Reading settings from {:?}", path);
            builder = builder.add_source(File::from(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Invalid settings")?;

        Ok(settings.normalized())
    }

    /// An empty subdomain means "let the relay pick".
    fn normalized(mut self) -> Self {
        if self.subdomain.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.subdomain = None;
        }
        self
    }
}
