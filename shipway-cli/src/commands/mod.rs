//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod grant;
mod run;
mod service;

pub use run::RunCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run inspection, triggers and cancellation
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Show the grants held by the executor identities
    Grants,
    /// Show what the target service is serving
    Service,
}

/// Routes a command to its handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        Commands::Runs { command } => run::handle_run_command(command, &client).await,
        Commands::Grants => grant::list_grants(&client).await,
        Commands::Service => service::show_service(&client).await,
    }
}
