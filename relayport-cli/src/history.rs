use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const HISTORY_FILE: &str = "history.toml";

/// One successfully started tunnel, as the user configured it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub local_port: u16,
    pub subdomain: String,
    pub server_ip: String,
    pub server_port: u16,
    /// Stored as RFC 3339.
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn now(local_port: u16, subdomain: &str, server_ip: &str, server_port: u16) -> Self {
        Self {
            local_port,
            subdomain: subdomain.to_string(),
            server_ip: server_ip.to_string(),
            server_port,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only record of started tunnels. Entries are never checked
/// against live sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub tunnels: Vec<HistoryEntry>,
}

impl History {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let history_file = config_dir.join(HISTORY_FILE);

        if history_file.exists() {
            let contents = std::fs::read_to_string(&history_file)
                .with_context(|| format!("Failed to read history file: {:?}", history_file))?;
            toml::from_str(&contents).context("Failed to parse history file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        let history_file = config_dir.join(HISTORY_FILE);
        let contents = toml::to_string_pretty(self).context("Failed to serialize history")?;
        std::fs::write(&history_file, contents)
            .with_context(|| format!("Failed to write history file: {:?}", history_file))?;
        Ok(())
    }

    pub fn append(config_dir: &Path, entry: HistoryEntry) -> Result<()> {
        let mut history = Self::load(config_dir)?;
        history.tunnels.push(entry);
        history.save(config_dir)
    }
}
