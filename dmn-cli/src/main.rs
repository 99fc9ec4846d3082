//! Deterministic masternode registry command line interface

use anyhow::Context;
use clap::{Parser, Subcommand};
use dmn_core::query::{self, ListFilter};
use dmn_core::{DmnConfig, FileUndoStore, MasternodeManager, OutPoint, SporkValues, UndoStore};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dmn")]
#[command(about = "Inspect a deterministic masternode registry")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered masternodes
    List {
        /// Only entries that are not banned
        #[arg(long)]
        valid: bool,
    },
    /// Show one masternode by collateral (<txid>-<index>)
    Info {
        collateral: String,
    },
    /// Check the stored undo chain and tip
    Verify,
    /// Show registry status
    Status {
        /// Height from which the registry drives payments
        #[arg(long)]
        deterministic_height: Option<u32>,
        /// Height from which wrong payees invalidate blocks
        #[arg(long)]
        enforcement_height: Option<u32>,
    },
    /// Write a default configuration file
    InitConfig {
        /// Output path
        #[arg(default_value = "dmn.toml")]
        output: PathBuf,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<DmnConfig> {
    let mut config = match &cli.config {
        Some(path) => DmnConfig::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => DmnConfig::load_default()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    tracing::debug!("Using registry data in {}", config.storage.data_dir.display());
    Ok(config)
}

fn open_manager(config: DmnConfig) -> anyhow::Result<MasternodeManager<FileUndoStore>> {
    let store = FileUndoStore::from_config(&config.storage)?;
    let tip = store
        .load_tip()?
        .with_context(|| format!("no registry state in {}", config.storage.data_dir.display()))?;
    let manager = MasternodeManager::open(config, store, tip.genesis_hash)?;
    Ok(manager)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::InitConfig { output } => {
            DmnConfig::default().save_to_file(output)?;
            println!("Configuration written to {}", output.display());
        }

        Commands::List { valid } => {
            let manager = open_manager(load_config(&cli)?)?;
            let filter = if *valid { ListFilter::Valid } else { ListFilter::All };
            print_json(&query::list(manager.tip(), filter))?;
        }

        Commands::Info { collateral } => {
            let outpoint: OutPoint = collateral
                .parse()
                .map_err(|e: String| anyhow::anyhow!("invalid collateral: {}", e))?;
            let manager = open_manager(load_config(&cli)?)?;
            print_json(&query::info(manager.tip(), &outpoint)?)?;
        }

        Commands::Verify => {
            let manager = open_manager(load_config(&cli)?)?;
            print_json(&query::verify_integrity(&manager)?)?;
        }

        Commands::Status {
            deterministic_height,
            enforcement_height,
        } => {
            let manager = open_manager(load_config(&cli)?)?;
            let sporks = SporkValues {
                deterministic_mns_height: *deterministic_height,
                payment_enforcement_height: *enforcement_height,
            };
            print_json(&query::status(&manager, &sporks))?;
        }
    }

    Ok(())
}
