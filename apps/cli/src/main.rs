//! sift CLI: inspect the model catalog and manage local model files.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use sift_catalog::ResourceType;
use tracing_subscriber::EnvFilter;

/// Manage the local models used by sift
#[derive(Parser, Debug)]
#[command(name = "sift", version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to <config dir>/sift/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the models directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// List catalog models
    Catalog {
        /// Only show one resource type
        #[arg(short = 't', long = "type", value_parser = parse_resource_type)]
        resource_type: Option<ResourceType>,
    },
    /// List model files in the models directory
    Models,
    /// Download a catalog model (and its companion, if any)
    Download { name: String },
    /// Delete a model file and any partial download
    Delete { name: String },
    /// Check whether the selected models and the host are ready
    Readiness,
    /// Show the memory budget for resident models
    Budget,
    /// Print the effective configuration
    Config,
}

fn parse_resource_type(value: &str) -> Result<ResourceType, String> {
    ResourceType::ALL
        .into_iter()
        .find(|ty| ty.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown resource type '{value}' (text, vision, embedding)"))
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sift")
        .join("config.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sift=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = sift_runtime::RuntimeConfig::load(&config_path)?;
    if let Some(models_dir) = cli.models_dir {
        config.models_dir = models_dir;
    }
    tracing::debug!(config = %config_path.display(), models_dir = %config.models_dir.display(), "Loaded configuration");

    let ctx = commands::Context::new(config, cli.json)?;
    match cli.command {
        Command::Catalog { resource_type } => commands::catalog(&ctx, resource_type),
        Command::Models => commands::models(&ctx).await,
        Command::Download { name } => commands::download(&ctx, &name).await,
        Command::Delete { name } => commands::delete(&ctx, &name).await,
        Command::Readiness => commands::readiness(&ctx).await,
        Command::Budget => commands::budget(&ctx),
        Command::Config => commands::config(&ctx),
    }
}
