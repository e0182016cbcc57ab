//! Conductor configuration CLI.
//!
//! Scaffolds and checks `conductor.toml`, the file read by the conductor
//! server at startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::exit_codes;
use conductor::io::config::{ConductorConfig, DEFAULT_CONFIG_FILE, load_config, write_config};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Task orchestration backbone: configuration tools"
)]
struct Cli {
    /// Config file path.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Parse and validate the config file.
    Validate,
    /// Print the effective config (file values over defaults).
    Show,
}

fn main() {
    conductor::logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Validate => cmd_validate(&cli.config),
        Command::Show => cmd_show(&cli.config),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        eprintln!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
        return Ok(exit_codes::EXISTS);
    }
    write_config(path, &ConductorConfig::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    if !path.exists() {
        anyhow::bail!("{} not found; run `conductor init`", path.display());
    }
    load_config(path)?;
    println!("{} is valid", path.display());
    Ok(exit_codes::OK)
}

fn cmd_show(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    print!("{}", toml::to_string_pretty(&cfg).context("serialize config toml")?);
    Ok(exit_codes::OK)
}
