use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use observatory::{logging, server, Observatory, ObservatoryConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "observatory")]
#[command(about = "Request, job and exception telemetry")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file; defaults plus OBSERVATORY_* variables when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for rolling JSON log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo application with the middleware stack and metrics endpoint
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
    /// Load, validate and print the resolved configuration
    CheckConfig {
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
    /// Emit a test metric through the configured exporter and flush it
    PushTest {
        #[arg(long, default_value = "observatory_push_test")]
        name: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Toml,
    Json,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ObservatoryConfig> {
    let config = match path {
        Some(path) => ObservatoryConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ObservatoryConfig::from_env().context("resolving config from environment")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_dir);

    match cli.command {
        Commands::Serve { addr } => {
            let config = load_config(cli.config.as_ref())?;
            let observatory = Arc::new(Observatory::new(config));
            server::start_server(observatory, addr).await?;
        }
        Commands::CheckConfig { format } => {
            let config = match load_config(cli.config.as_ref()) {
                Ok(config) => config,
                Err(e) => {
                    error!("Configuration is invalid: {:#}", e);
                    return Err(e);
                }
            };
            let rendered = match format {
                Format::Toml => toml::to_string_pretty(&config).context("rendering config as TOML")?,
                Format::Json => serde_json::to_string_pretty(&config)?,
            };
            println!("{}", rendered);
            info!("Configuration is valid");
        }
        Commands::PushTest { name } => {
            let config = load_config(cli.config.as_ref())?;
            let observatory = Observatory::new(config);
            observatory.increment(&name, &[("source", "cli")], 1);
            observatory.flush().await;
            println!("{}", observatory.output());
        }
    }
    Ok(())
}
