//! # Stagegate CLI Module
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server
//! - `init` - Write a starter config and create the ledger database
//! - `check-config` - Load and validate the config
//! - `stages` - Show the stage pipeline
//! - `order` - Show one order and its transfers
//! - `blocks` - List material blocks
//! - `verify-token` - Inspect a checkpoint token without using it

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

pub use commands::*;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Engine(#[from] stagegate_core::EngineError),

    #[error(transparent)]
    Store(#[from] stagegate_core::StoreError),

    #[error("{0}")]
    Io(String),

    #[error("Unknown backend '{0}' (expected redb or memory)")]
    Backend(String),
}

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Stagegate - production checkpoint server
///
/// Signed handoff tokens and material gating for orders moving through
/// manufacturing stages.
#[derive(Parser, Debug)]
#[command(name = "stagegate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML configuration
    #[arg(short = 'c', long, global = true, default_value = "stagegate.toml")]
    pub config: PathBuf,

    /// Path to the ledger database
    #[arg(short = 'D', long, global = true, default_value = "stagegate.redb")]
    pub database: PathBuf,

    /// Storage backend: "redb" (ACID database) or "memory" (lost on exit)
    #[arg(short = 'B', long, global = true, default_value = "redb")]
    pub backend: String,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to (overrides [server] host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write a starter config and create the ledger database
    Init {
        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// Load and validate the configuration
    CheckConfig,

    /// Show the stage pipeline
    Stages,

    /// Show an order and its transfer history
    Order {
        /// Order id
        id: u64,
    },

    /// List material blocks
    Blocks {
        /// Only blocks of this order
        #[arg(short, long)]
        order: Option<u64>,

        /// Only blocks at this stage (name or index)
        #[arg(short, long)]
        stage: Option<String>,

        /// Include resolved and ignored blocks
        #[arg(short, long)]
        all: bool,
    },

    /// Inspect a checkpoint token (JSON or scan code) without consuming it
    VerifyToken {
        /// The raw token
        token: String,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let ctx = Context {
        config: cli.config,
        database: cli.database,
        backend: cli.backend,
        json_mode: cli.json_mode,
    };

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(&ctx, host, port).await,
        Some(Commands::Init { force }) => cmd_init(&ctx, force),
        Some(Commands::CheckConfig) => cmd_check_config(&ctx),
        Some(Commands::Order { id }) => cmd_order(&ctx, id),
        Some(Commands::Blocks { order, stage, all }) => cmd_blocks(&ctx, order, stage.as_deref(), all),
        Some(Commands::VerifyToken { token }) => cmd_verify_token(&ctx, &token),
        Some(Commands::Stages) | None => cmd_stages(&ctx),
    }
}
