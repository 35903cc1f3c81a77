pub mod commands;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "vault-lease-pool")]
#[command(about = "Postgres pool that follows rotating secret leases")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the rotation and poll the payments table until Ctrl-C")]
    Watch(commands::watch::WatchArgs),

    #[command(about = "Build a pool from the current lease file and ping it")]
    Check(commands::check::CheckArgs),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);

    match cli.command {
        Commands::Watch(args) => commands::watch::handle(args, output_format).await,
        Commands::Check(args) => commands::check::handle(args, output_format).await,
    }
}
