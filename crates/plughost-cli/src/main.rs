//! Plughost CLI - run and manage the plugin hot-swap runtime.
//!
//! `plughost run` hosts plugins until interrupted. The other commands are
//! offline tooling: validating and signing plugin directories, managing the
//! publisher key, listing attached devices and printing the effective
//! configuration.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plughost_config::Config;

mod commands;
mod config_bridge;
mod theme;

use commands::{config, devices, keys, run, sign, validate};

/// Plughost - sandboxed plugins with hot reload
#[derive(Parser)]
#[command(name = "plughost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to an explicit configuration file
    #[arg(short, long, global = true, env = "PLUGHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every plugin and serve events until interrupted
    Run {
        /// Extra plugin root (repeatable), added to the configured ones
        #[arg(short, long)]
        plugin_dir: Vec<PathBuf>,
    },

    /// Validate a plugin directory against the schema and trusted signers
    Validate {
        /// Plugin directory
        dir: PathBuf,
        /// Accept a manifest without a signature block
        #[arg(long)]
        allow_unsigned: bool,
    },

    /// Sign a plugin directory's manifest over its code payload
    Sign {
        /// Plugin directory
        dir: PathBuf,
        /// Signer reference written into the manifest
        #[arg(short, long, default_value = "local")]
        signer: String,
        /// Secret key file (defaults to ~/.plughost/keys/signing.key)
        #[arg(short, long)]
        key: Option<PathBuf>,
    },

    /// Manage the publisher signing key
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Inspect attached devices
    Devices {
        #[command(subcommand)]
        command: DeviceCommands,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Show the public key and fingerprint
    Show {
        /// Secret key file
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
    /// Generate a new signing key
    Generate {
        /// Secret key file
        #[arg(short, long)]
        key: Option<PathBuf>,
        /// Replace an existing key
        #[arg(long)]
        force: bool,
        /// Also trust the key locally under this signer name
        #[arg(long)]
        trust: Option<String>,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// List attached USB devices
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the resolved configuration
    Show {
        /// Output format (toml or json)
        #[arg(short, long, default_value = "toml")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let resolved = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let log_config = config_bridge::to_log_config(&resolved.config, cli.verbose);
    if let Err(e) = plughost_telemetry::setup_logging(&log_config) {
        eprintln!("Warning: failed to set up logging: {e}");
    }

    match cli.command {
        Commands::Run { plugin_dir } => run::run(resolved.config, plugin_dir).await,
        Commands::Validate {
            dir,
            allow_unsigned,
        } => validate::validate(&resolved.config, &dir, allow_unsigned),
        Commands::Sign { dir, signer, key } => sign::sign(&resolved.config, &dir, &signer, key),
        Commands::Keys { command } => match command {
            KeyCommands::Show { key } => keys::show_key(key),
            KeyCommands::Generate { key, force, trust } => {
                keys::generate_key(&resolved.config, key, force, trust.as_deref())
            },
        },
        Commands::Devices { command } => match command {
            DeviceCommands::List => devices::list(&resolved.config),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show { format } => config::show(&resolved, &format),
        },
    }
}
