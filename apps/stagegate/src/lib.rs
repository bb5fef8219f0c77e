//! # stagegate
//!
//! The shop-floor server and operator CLI around `stagegate-core`.
//!
//! - [`api`]: axum REST API, operator API keys, rate limiting
//! - [`cli`]: clap commands
//! - [`config`]: TOML configuration and engine construction

pub mod api;
pub mod cli;
pub mod config;
