pub mod history;
pub mod start;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Start a tunnel to expose a local server
    Start(start::Args),

    /// Show previously started tunnels
    History(history::Args),
}
