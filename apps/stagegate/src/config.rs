//! # Configuration
//!
//! One TOML file describes the shop: the stage pipeline, per-stage material
//! requirements, the stock table, material name aliases, the token policy
//! and the operators allowed to call the API.
//!
//! ```toml
//! [token]
//! secret_env = "STAGEGATE_SECRET"
//!
//! [[stages]]
//! index = 0
//! name = "design"
//!
//! [[requirements]]
//! stage = "framing"
//! material = "Plywood"
//! quantity = "5"
//! unit = "sheet"
//!
//! [[operators]]
//! id = "lead"
//! api_key = "change-me"
//! can_generate_checkpoint = true
//! can_confirm = true
//! can_return_orders = true
//! ```
//!
//! When no `[[stages]]` are listed the built-in six-stage pipeline is used.

use crate::api::OperatorDirectory;
use serde::Deserialize;
use stagegate_core::primitives::DEFAULT_MAX_TOKEN_LIFETIME_SECS;
use stagegate_core::{
    AliasResolver, CapabilitySet, EngineError, InventoryError, LedgerStore, MaterialGate,
    MaterialRequirement, Principal, Quantity, RegistryError, RequirementBook, RetryPolicy, Stage,
    StageEngine, StageRegistry, StockTable, TokenSigner,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Environment variable read for the signing secret when `secret_env` is unset.
pub const SECRET_ENV_FALLBACK: &str = "STAGEGATE_SECRET";

/// Written by `stagegate init`.
pub const DEFAULT_CONFIG: &str = r#"# stagegate configuration

[server]
host = "127.0.0.1"
port = 8080
rate_limit = 100
max_body_bytes = 65536

[token]
# Read the HMAC secret (32+ bytes) from this environment variable.
secret_env = "STAGEGATE_SECRET"
max_lifetime_secs = 2592000

[retry]
max_attempts = 3
base_backoff_ms = 100

[[stages]]
index = 0
name = "design"

[[stages]]
index = 1
name = "framing"

[[stages]]
index = 2
name = "foam-molding"
allows_parallel_work = true

[[stages]]
index = 3
name = "sewing"
allows_parallel_work = true

[[stages]]
index = 4
name = "upholstery"

[[stages]]
index = 5
name = "assembly"

[[requirements]]
stage = "framing"
material = "Plywood"
quantity = 5
unit = "sheet"

[[stock]]
material = "Plywood"
quantity = 20

[aliases]
"ply" = "Plywood"

[[operators]]
id = "supervisor"
api_key = "change-me-supervisor-key"
can_generate_checkpoint = true
can_confirm = true
can_return_orders = true
"#;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid config: {0}")]
    Parse(String),

    #[error("Invalid stage pipeline: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Invalid stock line: {0}")]
    Stock(#[from] InventoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub requirements: Vec<RequirementConfig>,
    #[serde(default)]
    pub stock: Vec<StockConfig>,
    /// `alias = "Catalog Name"`.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Requests per second across all clients. 0 disables limiting.
    pub rate_limit: u32,
    /// `None` allows localhost only; `["*"]` allows any origin.
    pub cors_origins: Option<Vec<String>>,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rate_limit: 100,
            cors_origins: None,
            max_body_bytes: 64 * 1024,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    pub secret: Option<String>,
    pub secret_env: Option<String>,
    pub max_lifetime_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_env: None,
            max_lifetime_secs: DEFAULT_MAX_TOKEN_LIFETIME_SECS,
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("secret_env", &self.secret_env)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .finish()
    }
}

impl TokenConfig {
    /// The secret from the file, else from `secret_env`, else from
    /// `STAGEGATE_SECRET`.
    pub fn resolve_secret(&self) -> Result<String, ConfigError> {
        if let Some(secret) = &self.secret {
            return Ok(secret.clone());
        }
        let var = self.secret_env.as_deref().unwrap_or(SECRET_ENV_FALLBACK);
        std::env::var(var)
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("token.secret", format!("not set in config or ${var}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub allows_parallel_work: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl From<&StageConfig> for Stage {
    fn from(c: &StageConfig) -> Self {
        let stage = Stage::new(c.index, c.name.clone());
        let stage = if c.allows_parallel_work { stage.parallel() } else { stage };
        if c.is_active { stage } else { stage.inactive() }
    }
}

/// A material requirement; `stage` is a stage name or index.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementConfig {
    pub stage: String,
    pub material: String,
    pub quantity: Quantity,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_true")]
    pub is_required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StockConfig {
    pub material: String,
    pub quantity: Quantity,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorConfig {
    pub id: String,
    pub api_key: String,
    #[serde(default)]
    pub can_generate_checkpoint: bool,
    #[serde(default)]
    pub can_confirm: bool,
    #[serde(default)]
    pub can_return_orders: bool,
    /// Stage name or index the operator is bound to.
    #[serde(default)]
    pub stage: Option<String>,
}

impl std::fmt::Debug for OperatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorConfig")
            .field("id", &self.id)
            .field("api_key", &"<redacted>")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

fn default_true() -> bool {
    true
}

fn default_unit() -> String {
    "unit".to_string()
}

// =============================================================================
// LOADING
// =============================================================================

/// Everything the server and CLI need, built from a validated config.
pub struct Runtime {
    pub engine: Arc<StageEngine>,
    pub stock: Arc<StockTable>,
    pub operators: OperatorDirectory,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// The configured pipeline, or the built-in one.
    pub fn registry(&self) -> Result<StageRegistry, ConfigError> {
        if self.stages.is_empty() {
            return Ok(StageRegistry::default_pipeline());
        }
        Ok(StageRegistry::new(self.stages.iter().map(Stage::from).collect())?)
    }

    fn requirement_book(&self, registry: &StageRegistry) -> Result<RequirementBook, ConfigError> {
        let mut requirements = Vec::with_capacity(self.requirements.len());
        for (i, req) in self.requirements.iter().enumerate() {
            let stage = registry
                .resolve(&req.stage)
                .map_err(|e| invalid(format!("requirements[{i}].stage"), e.to_string()))?;
            if req.material.trim().is_empty() {
                return Err(invalid(format!("requirements[{i}].material"), "must not be empty"));
            }
            if !req.quantity.is_positive() {
                return Err(invalid(format!("requirements[{i}].quantity"), "must be positive"));
            }
            requirements.push(MaterialRequirement {
                stage_index: stage.index,
                material_name: req.material.trim().to_string(),
                required_quantity: req.quantity,
                unit: req.unit.clone(),
                is_required: req.is_required,
            });
        }
        Ok(RequirementBook::new(requirements))
    }

    fn operator_directory(&self, registry: &StageRegistry) -> Result<OperatorDirectory, ConfigError> {
        let mut ids = BTreeSet::new();
        let mut keys = BTreeSet::new();
        let mut entries = Vec::with_capacity(self.operators.len());
        for op in &self.operators {
            if op.id.trim().is_empty() {
                return Err(invalid("operators.id", "must not be empty"));
            }
            if op.api_key.is_empty() {
                return Err(invalid(format!("operators[{}].api_key", op.id), "must not be empty"));
            }
            if !ids.insert(op.id.as_str()) {
                return Err(invalid("operators.id", format!("'{}' is listed twice", op.id)));
            }
            if !keys.insert(op.api_key.as_str()) {
                return Err(invalid(
                    format!("operators[{}].api_key", op.id),
                    "is shared with another operator",
                ));
            }
            let stage_restriction = match &op.stage {
                Some(stage) => Some(
                    registry
                        .resolve(stage)
                        .map_err(|e| invalid(format!("operators[{}].stage", op.id), e.to_string()))?
                        .index,
                ),
                None => None,
            };
            let capabilities = CapabilitySet {
                can_generate_checkpoint: op.can_generate_checkpoint,
                can_confirm: op.can_confirm,
                can_return_orders: op.can_return_orders,
                stage_restriction,
            };
            entries.push((op.api_key.clone(), Principal::new(op.id.clone(), capabilities)));
        }
        Ok(OperatorDirectory::new(entries))
    }

    /// Check everything `build` would check, without opening a store.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let registry = self.registry()?;
        self.requirement_book(&registry)?;
        self.operator_directory(&registry)?;
        TokenSigner::new(self.token.resolve_secret()?, self.token.max_lifetime_secs)?;
        self.stock_table()?;
        for (alias, target) in &self.aliases {
            if !self.stock.iter().any(|s| s.material.trim() == target.trim()) {
                tracing::warn!(alias, target, "alias points at a material with no stock line");
            }
        }
        Ok(())
    }

    /// The stock table with every `[[stock]]` line loaded.
    fn stock_table(&self) -> Result<StockTable, ConfigError> {
        let stock = StockTable::new(Arc::new(AliasResolver::with_aliases(
            self.aliases.iter().map(|(a, n)| (a.as_str(), n.trim().to_string())),
        )));
        for (i, line) in self.stock.iter().enumerate() {
            if line.material.trim().is_empty() {
                return Err(invalid(format!("stock[{i}].material"), "must not be empty"));
            }
            if line.quantity.is_negative() {
                return Err(invalid(format!("stock[{i}].quantity"), "must not be negative"));
            }
            stock.set_stock(&line.material, line.quantity)?;
        }
        Ok(stock)
    }

    /// Build the engine over `store`.
    pub fn build(&self, store: Arc<dyn LedgerStore>) -> Result<Runtime, ConfigError> {
        let registry = self.registry()?;
        let requirements = self.requirement_book(&registry)?;
        let operators = self.operator_directory(&registry)?;
        let signer = TokenSigner::new(self.token.resolve_secret()?, self.token.max_lifetime_secs)?;

        let stock = Arc::new(self.stock_table()?);

        let gate = MaterialGate::new(requirements, stock.clone());
        let engine = StageEngine::new(Arc::new(registry), gate, signer, store).with_retry(self.retry.clone());

        tracing::info!(
            stages = engine.registry().list_active_stages().len(),
            requirements = self.requirements.len(),
            stock_lines = self.stock.len(),
            operators = operators.len(),
            "configuration loaded"
        );
        Ok(Runtime {
            engine: Arc::new(engine),
            stock,
            operators,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
