//! Operator console — entry point.
//!
//! ```text
//! linkbus watch status --types motors,sfp    Stream filtered events
//! linkbus send get_status '{}'               Command + reply round-trip
//! linkbus login -u admin -p secret           Authenticate the session
//! linkbus --gen-config                       Dump default config and exit
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use linkbus_core::{Bus, ConnectionInfo};

mod config;
use config::ConsoleConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "linkbus", about = "Operator console for a linkbus controller")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "linkbus.toml")]
    config: PathBuf,

    /// Controller address (overrides config). Example: 192.168.1.20:8080
    #[arg(short = 'a', long)]
    controller: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<ConsoleCommand>,
}

#[derive(Subcommand, Debug)]
enum ConsoleCommand {
    /// Subscribe to a topic and print accepted events as JSON lines.
    Watch {
        /// Topic to subscribe to.
        #[arg(default_value = "status")]
        topic: String,

        /// Accepted payload types (explicit allow-list).
        #[arg(short, long, value_delimiter = ',')]
        types: Vec<String>,
    },

    /// Send one command and print its reply.
    Send {
        /// Command name, e.g. get_status.
        name: String,

        /// JSON object payload.
        #[arg(default_value = "{}")]
        payload: String,
    },

    /// Authenticate and report the outcome.
    Login {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        password: String,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ConsoleConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = ConsoleConfig::load(&cli.config);
    init_logging(&config.logging.level);

    let Some(command) = cli.command else {
        return Err("no subcommand given (try `linkbus watch`)".into());
    };

    let address = cli
        .controller
        .unwrap_or_else(|| config.network.controller_address.clone());
    let info: ConnectionInfo = address.parse()?;
    info!(controller = %info, "connecting");
    let bus = Bus::connect(&info);

    match command {
        ConsoleCommand::Watch { topic, types } => watch(&bus, &topic, types).await?,
        ConsoleCommand::Send { name, payload } => send(&bus, &name, &payload).await?,
        ConsoleCommand::Login { username, password } => login(&bus, &username, &password).await?,
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ── Subcommands ──────────────────────────────────────────────────

async fn watch(bus: &Bus, topic: &str, types: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if types.is_empty() {
        warn!("empty type filter is an allow-list: no events will be delivered");
    }

    let mut events = bus.subscribe(topic, types)?;
    let mut link = bus.link_watch();
    info!(topic = %topic, "watching");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(payload) => println!("{}", serde_json::to_string(payload.as_value())?),
                None => break,
            },
            result = link.wait_for(|state| state.is_closed()) => {
                let _ = result?;
                error!("link closed");
                break;
            }
        }
    }
    Ok(())
}

async fn send(bus: &Bus, name: &str, payload: &str) -> Result<(), Box<dyn std::error::Error>> {
    let payload: Value = serde_json::from_str(payload)?;
    let reply = bus.send_command(name, payload)?.recv().await?;

    if reply.is_command_error() {
        error!(
            code = reply.error_code().unwrap_or(0),
            message = reply.error_message().unwrap_or(""),
            "command failed"
        );
        std::process::exit(1);
    }

    println!("{}", serde_json::to_string_pretty(reply.as_value())?);
    Ok(())
}

async fn login(bus: &Bus, username: &str, password: &str) -> Result<(), Box<dyn std::error::Error>> {
    if bus.authenticate(username, password).await? {
        info!(username = %username, "authenticated");
        Ok(())
    } else {
        error!("authentication refused");
        std::process::exit(1);
    }
}
