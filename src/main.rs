//! lensmem
//!
//! Keeps a projector's lens memory matched to the aspect ratio of whatever
//! is playing, and drives the theater lights from playback state.
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon; the media player writes JSON events to stdin
//! lensmem run --config lensmem.toml
//!
//! # List serial ports (projector RS-232, Insteon PowerLinc)
//! lensmem ports
//!
//! # One-off commands through the same transports
//! lensmem send lens 2.35
//! lensmem send dimmer 42.22.B8 50
//!
//! # Manage per-title overrides
//! lensmem override list
//! lensmem override set tt0133093 2.39
//! lensmem override clear tt0133093
//!
//! # Ask IMDb once
//! lensmem lookup tt0133093
//! ```

mod aspect;
mod config;
mod context;
mod dispatch;
mod engine;
mod error;
mod events;
mod lighting;
mod metadata;
mod overrides;
mod serial;
mod title;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aspect::{AspectRatio, LensBand};
use config::{Config, LineConfig, DEFAULT_CONFIG_FILE};
use context::AppContext;
use lighting::insteon::{set_level_frame, InsteonAddress};
use metadata::{ImdbSource, Lookup, MetadataResolver};
use overrides::OverrideStore;
use serial::transport::hex;
use serial::SerialTransport;
use title::{normalize_imdb_id, Title, TitleKey};

/// Projector lens-memory and lighting automation
#[derive(Parser)]
#[command(name = "lensmem")]
#[command(version)]
#[command(about = "Projector lens-memory and Insteon lighting automation")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,

    /// List available serial ports
    Ports,

    /// Send a single device command
    #[command(subcommand)]
    Send(SendCommands),

    /// Manage per-title aspect ratio overrides
    #[command(subcommand)]
    Override(OverrideCommands),

    /// Look up a title's aspect ratio
    Lookup {
        /// Title name or IMDb id (tt0133093)
        title: String,

        /// Release year, to narrow a name search
        #[arg(short, long)]
        year: Option<u16>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum SendCommands {
    /// Load the lens memory for an aspect ratio
    Lens {
        /// Aspect ratio (e.g., 1.85, 2.35, 2.39:1)
        ratio: String,

        /// Serial port path (overrides config)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate (overrides config)
        #[arg(short, long)]
        baud: Option<u32>,
    },

    /// Set one Insteon dimmer
    Dimmer {
        /// Device address (e.g., 42.22.B8)
        address: String,

        /// Level in percent
        percent: u8,

        /// Serial port path (overrides config)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate (overrides config)
        #[arg(short, long)]
        baud: Option<u32>,
    },
}

#[derive(Subcommand)]
enum OverrideCommands {
    /// List stored overrides
    List,

    /// Store an override
    Set {
        /// Title key (movie/tt0133093, tvshow/42, title/<slug>) or IMDb id
        key: String,

        /// Aspect ratio
        ratio: String,
    },

    /// Remove an override
    Clear {
        /// Title key or IMDb id
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Run => handle_run(&cli.config).await,
        Commands::Ports => serial::port::print_ports(),
        Commands::Send(cmd) => handle_send(&cli.config, cmd),
        Commands::Override(cmd) => handle_override(&cli.config, cmd),
        Commands::Lookup { title, year } => handle_lookup(&cli.config, &title, year).await,
        Commands::Config => {
            let config = load_config(&cli.config)?;
            print!("{}", config.to_toml().context("failed to encode configuration")?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load {}", path.display()))
}

async fn handle_run(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let context = AppContext::start(config)?;
    context.run().await
}

/// Apply command-line port overrides to a configured line
fn override_line(mut line: LineConfig, port: Option<String>, baud: Option<u32>) -> LineConfig {
    if let Some(port) = port {
        line.port = port;
    }
    if let Some(baud) = baud {
        line.baud_rate = baud;
    }
    line
}

fn send_frame(name: &str, line: &LineConfig, frame: &[u8]) -> Result<()> {
    let transport = SerialTransport::serial(name, line.port_config()).with_retries(line.retries);
    transport
        .send(frame)
        .with_context(|| format!("failed to send to {}", line.port))?;
    transport.close();

    println!(
        "{} {} ({} baud): {}",
        "[OK]".green().bold(),
        line.port.white(),
        line.baud_rate,
        hex(frame)
    );
    Ok(())
}

fn handle_send(path: &Path, cmd: SendCommands) -> Result<()> {
    let config = load_config(path)?;

    match cmd {
        SendCommands::Lens { ratio, port, baud } => {
            let ratio: AspectRatio = ratio.parse()?;
            let command = config
                .projector
                .lens
                .command_for(ratio)
                .ok_or_else(|| anyhow!("no lens preset for ratio {}", ratio))?;

            let band = LensBand::for_ratio(ratio)
                .map(|band| band.to_string())
                .unwrap_or_default();
            println!(
                "{} Ratio {} ({} band) -> {}",
                "[*]".cyan().bold(),
                ratio.to_string().white(),
                band,
                command
            );
            let line = override_line(config.projector.line(), port, baud);
            send_frame("projector", &line, &command.to_bytes())
        }

        SendCommands::Dimmer {
            address,
            percent,
            port,
            baud,
        } => {
            let address = InsteonAddress::parse(&address)
                .ok_or_else(|| anyhow!("'{}' is not an Insteon address (AA.BB.CC)", address))?;
            if percent > 100 {
                bail!("level must be 0-100, got {}", percent);
            }

            println!(
                "{} Dimmer {} -> {}%",
                "[*]".cyan().bold(),
                address.to_string().white(),
                percent
            );
            let line = override_line(config.lighting.line(), port, baud);
            send_frame("plm", &line, &set_level_frame(address, percent))
        }
    }
}

fn handle_override(path: &Path, cmd: OverrideCommands) -> Result<()> {
    let config = load_config(path)?;
    let store = OverrideStore::new(&config.overrides.path);

    match cmd {
        OverrideCommands::List => {
            let entries = store.list()?;
            if entries.is_empty() {
                println!(
                    "{} in {}",
                    "No overrides stored".yellow(),
                    store.path().display()
                );
                return Ok(());
            }

            println!("{}", "Aspect Ratio Overrides".cyan().bold());
            println!("{}", "=".repeat(60));
            for entry in entries {
                println!(
                    "  {:<36} {:>6}  {}",
                    entry.key.as_str().white().bold(),
                    entry.ratio.to_string().green(),
                    entry.updated.unwrap_or_default().dimmed()
                );
            }
        }

        OverrideCommands::Set { key, ratio } => {
            let key = TitleKey::from_user(&key);
            let ratio: AspectRatio = ratio.parse()?;
            if !ratio.is_known() {
                bail!("an override needs an explicit ratio");
            }
            store.set(&key, ratio)?;
            println!("{} {} = {}", "[OK]".green().bold(), key, ratio);
        }

        OverrideCommands::Clear { key } => {
            let key = TitleKey::from_user(&key);
            if store.clear(&key)? {
                println!("{} Cleared {}", "[OK]".green().bold(), key);
            } else {
                println!("{} No override for {}", "[!]".yellow().bold(), key);
            }
        }
    }

    Ok(())
}

async fn handle_lookup(path: &Path, text: &str, year: Option<u16>) -> Result<()> {
    let config = load_config(path)?;
    let title = match normalize_imdb_id(text) {
        Some(id) => Title::new(&id, year, Some(&id), None),
        None => Title::new(text, year, None, None),
    };

    println!(
        "{} Looking up {} [{}]",
        "[*]".cyan().bold(),
        title.to_string().white(),
        title.key
    );

    let store = OverrideStore::new(&config.overrides.path);
    if let Some(ratio) = store.get(&title.key)? {
        println!("  Override: {}", ratio.to_string().green().bold());
    }

    let source = ImdbSource::new(&config.metadata).context("failed to build metadata client")?;
    let resolver = MetadataResolver::new(Arc::new(source), &config.metadata);
    match resolver.resolve(&title).await {
        Lookup::Found(ratio) => {
            let lens = config
                .projector
                .lens
                .command_for(ratio)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "no preset".to_string());
            println!("  Metadata: {} ({})", ratio.to_string().green().bold(), lens);
        }
        Lookup::NotFound => println!("  Metadata: {}", "not found".yellow()),
    }

    Ok(())
}
