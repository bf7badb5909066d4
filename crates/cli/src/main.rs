//! metalctl - Main Entry Point
//!
//! Creates, inspects, reconciles and frees machines on a metal API.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::debug;

use metal_provider::ProviderConfig;

mod commands;
mod output;

use commands::{image, machine};

/// Reconcile bare-metal machines against a metal API
#[derive(Parser)]
#[command(name = "metalctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Provider configuration file
    #[arg(long, env = "METAL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// API endpoint, overrides the configuration file
    #[arg(long, env = "METAL_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// API token, overrides the configuration file
    #[arg(long, env = "METAL_AUTH_TOKEN", hide_env_values = true, global = true)]
    auth_token: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage machines
    #[command(subcommand)]
    Machine(machine::MachineCommands),

    /// Look up operating system images
    #[command(subcommand)]
    Image(image::ImageCommands),

    /// Manage the provider configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init,

    /// Show the effective configuration
    Show,
}

fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".metal")
        .join("provider.toml")
}

fn load_config(path: &Path, endpoint: Option<String>, auth_token: Option<String>) -> anyhow::Result<ProviderConfig> {
    let mut config = ProviderConfig::load(path)
        .with_context(|| format!("cannot load config {}", path.display()))?
        .apply_env();

    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    if let Some(token) = auth_token {
        config.auth_token = token;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path, cli.endpoint, cli.auth_token)?;
    debug!("Using config {} against {}", config_path.display(), config.endpoint);

    let result = match cli.command {
        Commands::Machine(cmd) => {
            config.validate()?;
            machine::execute(cmd, &config, cli.format).await
        }
        Commands::Image(cmd) => {
            config.validate()?;
            image::execute(cmd, &config, cli.format).await
        }
        Commands::Config(ConfigCommands::Init) => {
            if config_path.exists() {
                output::print_warning(&format!("{} already exists", config_path.display()));
                Ok(())
            } else {
                ProviderConfig::default().save(&config_path)?;
                output::print_success(&format!("Wrote {}", config_path.display()));
                Ok(())
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            println!("{:#?}", config);
            Ok(())
        }
        Commands::Version => {
            println!("metalctl v{}", metal_common::VERSION);
            Ok(())
        }
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
