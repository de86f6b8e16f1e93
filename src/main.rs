mod workflow;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay_core::config::AppConfig;
use relay_http::{HttpAdapter, UrlGuard};

use crate::workflow::Workflow;

#[derive(Parser)]
#[command(name = "relay", version, about = "Chain, batch, retry and stream HTTP calls")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file and print its result as JSON
    Run {
        /// Workflow TOML file
        workflow: PathBuf,
        /// Print every stage result of a chain, not only the last one
        #[arg(long)]
        all: bool,
    },
    /// Check a URL against the configured security policy
    CheckUrl {
        url: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "relay", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { workflow, all } => {
            let wf = Workflow::load(&workflow)?;
            let adapter = Arc::new(HttpAdapter::from_app_config(&config)?);
            let flow = wf.build(&config, adapter)?;

            info!(path = %workflow.display(), stages = wf.stages.len(), "Running workflow");
            match flow.run(all).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                Err(e) => {
                    error!(error = %e, "Workflow failed");
                    if let Some(req) = e.request_config() {
                        eprintln!("Failed request: {} {}", req.verb, req.target);
                    }
                    return Err(e.into());
                }
            }
        }
        Commands::CheckUrl { url } => {
            let guard = UrlGuard::new(config.security.clone());
            match guard.check(&url) {
                Ok(parsed) => println!("allowed: {}", parsed),
                Err(violation) => {
                    println!("blocked: {}", violation);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the config file, falling back to `~/.relay/config.toml`, then to
/// defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    match AppConfig::default_path() {
        Some(home) if home.exists() => {
            info!(path = %home.display(), "Loading config from home directory");
            Ok(AppConfig::load(&home)?)
        }
        _ => Ok(AppConfig::load_or_default(path)?),
    }
}
