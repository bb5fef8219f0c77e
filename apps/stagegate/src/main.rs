//! # Stagegate - Production Checkpoint Server
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                apps/stagegate (THE BINARY)            │
//! │                                                       │
//! │   ┌─────────────┐   ┌─────────────┐   ┌───────────┐   │
//! │   │    CLI      │   │  HTTP API   │   │  Config   │   │
//! │   │   (clap)    │   │   (axum)    │   │  (toml)   │   │
//! │   └──────┬──────┘   └──────┬──────┘   └─────┬─────┘   │
//! │          └─────────────────┼────────────────┘         │
//! │                            ▼                          │
//! │                   ┌─────────────────┐                 │
//! │                   │ stagegate-core  │                 │
//! │                   │  (THE ENGINE)   │                 │
//! │                   └─────────────────┘                 │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! stagegate init
//! STAGEGATE_SECRET=... stagegate server --port 8080
//! stagegate order 1042
//! stagegate blocks --stage framing
//! ```

use clap::Parser;
use stagegate::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // STAGEGATE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("STAGEGATE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.verbose {
        "stagegate=debug,stagegate_core=debug,tower_http=debug"
    } else {
        "stagegate=info,stagegate_core=info,tower_http=debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        println!("stagegate v{}", env!("CARGO_PKG_VERSION"));
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
