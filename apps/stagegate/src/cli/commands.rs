//! # CLI Command Implementations

use super::CliError;
use crate::api::{self, AppState};
use crate::config::{Config, DEFAULT_CONFIG, Runtime};
use serde::Serialize;
use stagegate_core::{
    BlockFilter, LedgerStore, MemoryStore, OrderId, RedbStore, TokenState,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Global options shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: PathBuf,
    pub database: PathBuf,
    pub backend: String,
    pub json_mode: bool,
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Open the ledger store for the selected backend.
pub fn open_store(ctx: &Context) -> Result<Arc<dyn LedgerStore>, CliError> {
    match ctx.backend.as_str() {
        "redb" => Ok(Arc::new(RedbStore::open(&ctx.database)?)),
        "memory" => {
            tracing::warn!("memory backend: nothing is persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
        other => Err(CliError::Backend(other.to_string())),
    }
}

/// Load the config and build the engine over the selected store.
pub fn load_runtime(ctx: &Context) -> Result<(Config, Runtime), CliError> {
    let config = Config::load(&ctx.config)?;
    let runtime = config.build(open_store(ctx)?)?;
    Ok((config, runtime))
}

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

pub async fn cmd_server(ctx: &Context, host: Option<String>, port: Option<u16>) -> Result<(), CliError> {
    let (config, runtime) = load_runtime(ctx)?;
    let mut server = config.server.clone();
    if let Some(host) = host {
        server.host = host;
    }
    if let Some(port) = port {
        server.port = port;
    }

    println!("Stagegate Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Config:    {}", ctx.config.display());
    println!("  Host:      {}", server.host);
    println!("  Port:      {}", server.port);
    println!("  Backend:   {}", ctx.backend);
    println!("  Database:  {}", ctx.database.display());
    println!("  Stages:    {}", runtime.engine.registry().list_active_stages().len());
    println!("  Operators: {}", runtime.operators.len());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", server.host, server.port);
    let state = AppState::new(runtime.engine, runtime.stock, runtime.operators);
    api::run_server(&addr, state, &server)
        .await
        .map_err(|e| CliError::Io(format!("Server error on {addr}: {e}")))
}

// =============================================================================
// INIT / CHECK-CONFIG
// =============================================================================

/// Write the starter config (unless present) and create the database.
pub fn cmd_init(ctx: &Context, force: bool) -> Result<(), CliError> {
    if ctx.config.exists() && !force {
        return Err(CliError::Io(format!(
            "Config {} already exists. Use --force to overwrite.",
            ctx.config.display()
        )));
    }
    std::fs::write(&ctx.config, DEFAULT_CONFIG)
        .map_err(|e| CliError::Io(format!("Write config: {e}")))?;
    println!("Wrote starter config to {}", ctx.config.display());

    if ctx.backend == "redb" {
        RedbStore::open(&ctx.database)?;
        println!("Initialized ledger database at {}", ctx.database.display());
    }
    println!("Set STAGEGATE_SECRET (32+ bytes) and replace the sample API key before serving.");
    Ok(())
}

pub fn cmd_check_config(ctx: &Context) -> Result<(), CliError> {
    let config = Config::load(&ctx.config)?;
    config.validate()?;
    let registry = config.registry()?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "config": ctx.config.to_string_lossy(),
            "valid": true,
            "stages": registry.list_active_stages().len(),
            "requirements": config.requirements.len(),
            "stock_lines": config.stock.len(),
            "operators": config.operators.len(),
        }));
        return Ok(());
    }

    println!("Config {} is valid", ctx.config.display());
    println!("  Stages:       {}", registry.list_active_stages().len());
    println!("  Requirements: {}", config.requirements.len());
    println!("  Stock lines:  {}", config.stock.len());
    println!("  Operators:    {}", config.operators.len());
    Ok(())
}

// =============================================================================
// STAGES
// =============================================================================

pub fn cmd_stages(ctx: &Context) -> Result<(), CliError> {
    let config = Config::load(&ctx.config)?;
    let registry = config.registry()?;

    if ctx.json_mode {
        let stages: Vec<api::StageJson> = registry.list_active_stages().iter().map(Into::into).collect();
        print_json(&stages);
        return Ok(());
    }

    println!("Stage Pipeline");
    println!("==============");
    for stage in registry.list_active_stages() {
        let parallel = if stage.allows_parallel_work { "  (parallel)" } else { "" };
        println!("  {:>2}  {}{}", stage.index, stage.name, parallel);
    }
    for stage in registry.inactive_stages() {
        println!("   -  {} (inactive)", stage.name);
    }
    Ok(())
}

// =============================================================================
// ORDER
// =============================================================================

pub fn cmd_order(ctx: &Context, id: u64) -> Result<(), CliError> {
    let (_, runtime) = load_runtime(ctx)?;
    let summary = runtime.engine.order_summary(OrderId(id))?;
    let transfers = runtime.engine.transfers(OrderId(id))?;

    if ctx.json_mode {
        print_json(&serde_json::json!({ "order": summary, "transfers": transfers }));
        return Ok(());
    }

    println!("Order {}", summary.order_id);
    println!("  Position:     {}", summary.position);
    if let Some(name) = &summary.stage_name {
        println!("  Stage:        {name}");
    }
    match summary.active_token {
        Some(token) => println!("  Active token: {token}"),
        None => println!("  Active token: none"),
    }
    println!("  Version:      {}", summary.version);
    println!();
    println!("Transfers:");
    for t in &transfers {
        let from = t.from_stage.map_or_else(|| "-".to_string(), |s| s.to_string());
        let to = t.to_stage.map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "  #{:<4} {:>3} -> {:<3} {:?}/{:?} by {}",
            t.id, from, to, t.status, t.transfer_type, t.scanned_by
        );
    }
    Ok(())
}

// =============================================================================
// BLOCKS
// =============================================================================

pub fn cmd_blocks(ctx: &Context, order: Option<u64>, stage: Option<&str>, all: bool) -> Result<(), CliError> {
    let (_, runtime) = load_runtime(ctx)?;
    let stage = stage
        .map(|s| runtime.engine.registry().resolve(s).map(|s| s.index))
        .transpose()?;
    let base = if all { BlockFilter::default() } else { BlockFilter::active() };
    let blocks = runtime.engine.list_blocks(&BlockFilter {
        order_id: order.map(OrderId),
        stage,
        ..base
    })?;

    if ctx.json_mode {
        print_json(&blocks);
        return Ok(());
    }

    if blocks.is_empty() {
        println!("No blocks");
        return Ok(());
    }
    for b in &blocks {
        println!(
            "  #{:<4} order {} stage {} {} missing {} {} ({:?})",
            b.id, b.order_id, b.stage, b.material_name, b.missing_quantity, b.unit, b.status
        );
    }
    Ok(())
}

// =============================================================================
// VERIFY TOKEN
// =============================================================================

pub fn cmd_verify_token(ctx: &Context, token: &str) -> Result<(), CliError> {
    let (_, runtime) = load_runtime(ctx)?;
    let inspection = runtime.engine.inspect_token(token)?;

    if ctx.json_mode {
        print_json(&inspection);
        return Ok(());
    }

    println!("Token for order {} -> stage {}", inspection.order_id, inspection.stage_id);
    println!("  Issued at:  {}", inspection.issued_at);
    println!("  Expires at: {}", inspection.expires_at);
    let state = match inspection.state {
        TokenState::Active => "active",
        TokenState::Consumed => "consumed",
        TokenState::Superseded => "superseded",
        TokenState::Unknown => "not issued by this ledger",
    };
    println!("  State:      {state}");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
