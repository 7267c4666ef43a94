//! Start command - resolves tunnel settings, starts a session and keeps it
//! running until interrupted.

use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use relayport::config::{parse_port, validate_subdomain};
use relayport::{
    ConfigError, RelayScheme, SessionId, SessionRegistry, TunnelConfig, TunnelError,
    TunnelSession,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::history::{History, HistoryEntry};

/// Expose a local server through a tunnel
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Local port to forward to
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Subdomain to request (lowercase letters, numbers and hyphens)
    #[arg(short, long, value_parser = parse_subdomain_flag)]
    subdomain: Option<String>,

    /// Tunnel server host name or IP
    #[arg(long)]
    server_ip: Option<String>,

    /// Tunnel server port
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    server_port: Option<u16>,

    /// Connect with ws:// instead of wss://
    #[arg(long)]
    insecure_ws: bool,

    /// Use configured defaults instead of prompting
    #[arg(short = 'y', long)]
    yes: bool,
}

fn parse_subdomain_flag(input: &str) -> Result<String, ConfigError> {
    validate_subdomain(input)?;
    Ok(input.to_string())
}

/// Answers for one tunnel, after flags, settings and prompts are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Choices {
    local_port: u16,
    subdomain: Option<String>,
    server_ip: String,
    server_port: u16,
    insecure_ws: bool,
}

pub async fn execute(args: &Args, config_dir: Option<&Path>) -> Result<()> {
    let settings = Settings::load(config_dir)?;
    let mut console = Console::spawn();
    let choices = resolve(args, &settings, &mut console).await?;

    let scheme = if choices.insecure_ws {
        RelayScheme::Ws
    } else {
        RelayScheme::Wss
    };
    let config = TunnelConfig::new(
        choices.local_port,
        choices.subdomain.clone(),
        choices.server_ip.as_str(),
        choices.server_port,
    )?
    .with_relay_scheme(scheme);

    println!(
        "\nConnecting to tunnel server at {}:{}...",
        choices.server_ip, choices.server_port
    );
    let session = TunnelSession::new(config)?;
    if let Err(e) = session.start().await {
        eprintln!("Failed to create tunnel");
        print_troubleshooting(&e, &choices);
        return Err(e).context("Tunnel could not be started");
    }

    let registry = SessionRegistry::new();
    registry.add(session.clone()).await?;

    println!("Tunnel created successfully!");
    println!();
    println!("Tunnel Details:");
    println!("  Local server:  http://localhost:{}", choices.local_port);
    println!(
        "  Tunnel server: {}:{}",
        choices.server_ip, choices.server_port
    );
    println!(
        "  Public URL:    https://{}.{}",
        session.subdomain(),
        choices.server_ip
    );

    if let Some(config_dir) = config_dir {
        let entry = HistoryEntry::now(
            choices.local_port,
            session.subdomain(),
            &choices.server_ip,
            choices.server_port,
        );
        if let Err(e) = History::append(config_dir, entry) {
            eprintln!("Warning: failed to save tunnel history: {:#}", e);
        }
    }

    println!();
    println!("Tunnel is active. Type 'help' for commands, or press Ctrl+C to stop.");

    let outcome = serve(&registry, &session, &mut console).await;

    println!("\nShutting down tunnel...");
    let failures = registry.stop_all().await;
    for (id, e) in &failures {
        eprintln!("Failed to stop tunnel {}: {}", id, e);
    }

    if let Outcome::Lost(id) = outcome {
        bail!("Tunnel {} closed: connection to the tunnel server was lost", id);
    }
    if !failures.is_empty() {
        bail!("{} tunnel(s) did not stop cleanly", failures.len());
    }
    Ok(())
}

async fn resolve(args: &Args, settings: &Settings, console: &mut Console) -> Result<Choices> {
    let interactive = !args.yes;

    let local_port = match args.port {
        Some(port) => port,
        None if interactive => {
            console
                .ask(
                    "Enter the local port to tunnel",
                    &settings.local_port.to_string(),
                    |input| parse_port("local port", input),
                )
                .await?
        }
        None => settings.local_port,
    };

    let subdomain = match &args.subdomain {
        Some(subdomain) => Some(subdomain.clone()),
        None if interactive => {
            console
                .ask(
                    "Enter desired subdomain (leave empty for random)",
                    settings.subdomain.as_deref().unwrap_or_default(),
                    parse_subdomain_answer,
                )
                .await?
        }
        None => settings.subdomain.clone(),
    };

    let server_ip = match &args.server_ip {
        Some(server_ip) => server_ip.clone(),
        None if interactive => {
            console
                .ask(
                    "Enter tunnel server IP/domain",
                    &settings.server_ip,
                    parse_server_ip,
                )
                .await?
        }
        None => settings.server_ip.clone(),
    };

    let server_port = match args.server_port {
        Some(port) => port,
        None if interactive => {
            console
                .ask(
                    "Enter tunnel server port",
                    &settings.server_port.to_string(),
                    |input| parse_port("server port", input),
                )
                .await?
        }
        None => settings.server_port,
    };

    Ok(Choices {
        local_port,
        subdomain,
        server_ip,
        server_port,
        insecure_ws: args.insecure_ws || settings.insecure_ws,
    })
}

fn parse_subdomain_answer(input: &str) -> Result<Option<String>, ConfigError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    validate_subdomain(input)?;
    Ok(Some(input.to_string()))
}

fn parse_server_ip(input: &str) -> Result<String, ConfigError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigError::MissingRelayHost);
    }
    Ok(input.to_string())
}

fn print_troubleshooting(err: &TunnelError, choices: &Choices) {
    eprintln!("\nError details: {}", err);

    match err.io_kind() {
        Some(io::ErrorKind::ConnectionRefused) => {
            eprintln!("\nTroubleshooting tips:");
            eprintln!("1. Check if the tunnel server is running at the specified address");
            eprintln!(
                "2. Verify that {}:{} is accessible",
                choices.server_ip, choices.server_port
            );
            eprintln!("3. Check your firewall settings");
            eprintln!("4. If using a domain, verify DNS resolution");
        }
        Some(io::ErrorKind::ConnectionReset) => {
            eprintln!("\nTroubleshooting tips:");
            eprintln!("1. The connection was reset by the server");
            eprintln!("2. Check if the server supports WebSocket connections");
            eprintln!("3. Try the other protocol (--insecure-ws for ws://, default wss://)");
        }
        _ => {}
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Interrupted,
    Quit,
    /// Every tunnel was stopped from the console.
    Stopped,
    /// The relay connection of this tunnel ended on its own.
    Lost(SessionId),
}

async fn serve(
    registry: &SessionRegistry,
    session: &Arc<TunnelSession>,
    console: &mut Console,
) -> Outcome {
    let mut stopped_locally = HashSet::new();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let stopped = session.stopped();
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                return Outcome::Interrupted;
            }
            _ = &mut stopped => {
                if stopped_locally.contains(session.id()) {
                    return Outcome::Stopped;
                }
                eprintln!("Tunnel {} closed by the tunnel server", session.id());
                return Outcome::Lost(session.id().clone());
            }
            line = console.next_line(), if stdin_open => {
                let Some(line) = line else {
                    debug!("stdin closed; console commands disabled");
                    stdin_open = false;
                    continue;
                };
                match ConsoleCommand::parse(&line) {
                    ConsoleCommand::Empty => {}
                    ConsoleCommand::Help => print_help(),
                    ConsoleCommand::List => print_sessions(registry).await,
                    ConsoleCommand::Stop(id) => {
                        if let Some(id) = stop_session(registry, console, id).await {
                            stopped_locally.insert(id);
                        }
                    }
                    ConsoleCommand::Quit => return Outcome::Quit,
                    ConsoleCommand::Unknown(other) => {
                        println!("Unknown command '{}'. Type 'help' for commands.", other);
                    }
                }
            }
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  list        Show active tunnels");
    println!("  stop [id]   Stop a tunnel");
    println!("  quit        Stop all tunnels and exit");
}

async fn print_sessions(registry: &SessionRegistry) {
    let sessions = registry.list().await;
    if sessions.is_empty() {
        println!("No active tunnels");
        return;
    }

    println!("Active tunnels:");
    for info in sessions {
        println!(
            "- [{}] {}.{} -> localhost:{} ({:?})",
            info.id, info.subdomain, info.relay_host, info.target_port, info.state
        );
    }
}

/// Stops the chosen session and returns its id. Asks for an id when
/// several tunnels are active.
async fn stop_session(
    registry: &SessionRegistry,
    console: &mut Console,
    id: Option<String>,
) -> Option<SessionId> {
    let id = match id {
        Some(id) => SessionId::from(id.as_str()),
        None => {
            let sessions = registry.list().await;
            match sessions.as_slice() {
                [] => {
                    println!("No active tunnels to stop");
                    return None;
                }
                [only] => only.id.clone(),
                _ => {
                    print_sessions(registry).await;
                    print!("Select tunnel to stop (id): ");
                    let _ = io::stdout().flush();
                    let answer = console.next_line().await?;
                    SessionId::from(answer.as_str())
                }
            }
        }
    };

    if registry.get(&id).await.is_none() {
        println!("No active tunnel with id '{}'", id);
        return None;
    }

    println!("Stopping tunnel {}...", id);
    match registry.remove(&id).await {
        Ok(()) => println!("Tunnel stopped successfully"),
        Err(e) => eprintln!("Failed to stop tunnel: {}", e),
    }
    Some(id)
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Empty,
    Help,
    List,
    Stop(Option<String>),
    Quit,
    Unknown(String),
}

impl ConsoleCommand {
    fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        match words.next() {
            None => ConsoleCommand::Empty,
            Some("help" | "?") => ConsoleCommand::Help,
            Some("list" | "ls") => ConsoleCommand::List,
            Some("stop") => ConsoleCommand::Stop(words.next().map(str::to_string)),
            Some("quit" | "exit") => ConsoleCommand::Quit,
            Some(other) => ConsoleCommand::Unknown(other.to_string()),
        }
    }
}

/// Line-oriented stdin, read on a dedicated thread so a pending read never
/// holds up runtime shutdown.
struct Console {
    lines: mpsc::UnboundedReceiver<String>,
}

impl Console {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { lines: rx }
    }

    /// `None` once stdin is closed.
    async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await.map(|line| line.trim().to_string())
    }

    /// Prompts until `parse` accepts the answer. An empty answer, or a
    /// closed stdin, takes `default`.
    async fn ask<T>(
        &mut self,
        question: &str,
        default: &str,
        parse: impl Fn(&str) -> Result<T, ConfigError>,
    ) -> Result<T> {
        loop {
            print!("{} [{}]: ", question, default);
            io::stdout().flush()?;

            let Some(answer) = self.next_line().await else {
                println!();
                return Ok(parse(default)?);
            };
            let input = if answer.is_empty() { default } else { answer.as_str() };
            match parse(input) {
                Ok(value) => return Ok(value),
                Err(e) => println!("{}", e),
            }
        }
    }
}
