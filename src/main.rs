//! voicegate - realtime voice conversation gateway.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voicegate::config::loader;
use voicegate::gateway::Gateway;
use voicegate::realtime::RealtimeServer;

pub(crate) const VERSION: &str = "0.1.0";

#[derive(Parser)]
#[command(name = "voicegate", about = "voicegate - Realtime Voice Gateway", version = VERSION)]
struct Cli {
    /// Path to the configuration file (default: ~/.voicegate/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the realtime gateway server.
    Serve {
        /// Override the configured listen port.
        #[arg(short, long)]
        port: Option<u16>,
        /// Verbose logging.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the resolved configuration and exit.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, verbose } => {
            let default_filter = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(default_filter)),
                )
                .init();

            let mut config = loader::load_config(cli.config.as_deref());
            if let Some(port) = port {
                config.server.port = port;
            }
            if config.history.db_path.is_none() {
                let db = loader::get_data_dir().join("call_history.db");
                config.history.db_path = Some(db.to_string_lossy().into_owned());
            }

            let gateway = Gateway::new(config)?;
            let server = RealtimeServer::new(gateway);
            let addr = server.start().await?;
            tracing::info!("voicegate ready on ws://{}", addr);

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            server.stop();
        }
        Commands::Config => {
            let config = loader::load_config(cli.config.as_deref());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
