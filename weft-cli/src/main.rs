//! weft CLI — serve and inspect WebAssembly HTTP middleware guests.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Run WebAssembly HTTP handlers as middleware.
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a guest middleware in front of a built-in echo handler
    Serve {
        /// Path to the compiled guest (.wasm)
        guest: String,

        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Opaque configuration passed to the guest via `get_config`
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Statically check a guest binary's imports and exports
    Validate {
        /// Path to the compiled guest (.wasm)
        guest: String,
    },

    /// Show version information
    Version,
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            guest,
            host,
            port,
            config,
        } => commands::serve::run(&guest, &host, port, config).await,
        Commands::Validate { guest } => commands::validate::run(&guest),
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
