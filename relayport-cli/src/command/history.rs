use std::path::Path;

use anyhow::Result;

use crate::history::History;

#[derive(Debug, clap::Args)]
pub struct Args {}

pub fn execute(_args: &Args, config_dir: Option<&Path>) -> Result<()> {
    let Some(config_dir) = config_dir else {
        println!("No config directory available; history is not recorded.");
        return Ok(());
    };

    let history = History::load(config_dir)?;
    if history.tunnels.is_empty() {
        println!("No tunnels started yet.");
        return Ok(());
    }

    println!("Previously started tunnels:");
    for entry in &history.tunnels {
        println!(
            "  {}: {}.{} -> localhost:{} (relay {}:{})",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.subdomain,
            entry.server_ip,
            entry.local_port,
            entry.server_ip,
            entry.server_port
        );
    }

    Ok(())
}
