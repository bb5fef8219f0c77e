//! # stagegate-core
//!
//! The checkpoint token and stage-gating engine for production orders.
//!
//! An order moves through an ordered list of manufacturing stages. A
//! supervisor requests a handoff to a target stage; the material gate checks
//! that the stage's materials are in stock; a signed checkpoint token is
//! issued and later scanned at the receiving station, which moves the order.
//!
//! ## Architectural Constraints
//!
//! - Synchronous: no async, no network. The app layer wraps calls in
//!   blocking tasks.
//! - One write path per order: every mutation is a versioned batch commit,
//!   retried on conflict.
//! - Identity is resolved by the caller and passed in as a [`Principal`].
//! - Collaborators (inventory, notifications, clock, storage) sit behind
//!   traits.

// =============================================================================
// MODULES
// =============================================================================

pub mod auth;
pub mod clock;
pub mod engine;
pub mod error;
pub mod gate;
pub mod inventory;
pub mod ledger;
pub mod normalize;
pub mod notify;
pub mod primitives;
pub mod retry;
pub mod stage;
pub mod storage;
pub mod token;
pub mod types;

// =============================================================================
// RE-EXPORTS: Types and errors
// =============================================================================

pub use error::{EngineError, StoreError, TokenError};
pub use types::{
    BlockId, OperatorId, OrderId, OrderPosition, OrderRecord, Quantity, QuantityParseError,
    StageIndex, TokenId, TransferId,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use auth::{Capability, CapabilitySet, Principal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    ConfirmOutcome, HandoffOutcome, IssuedHandoff, OrderSummary, ReadyOutcome, ShipOutcome,
    StageEngine, TokenInspection, TokenState,
};
pub use gate::{
    GateReport, Inventory, InventoryError, MaterialGate, MaterialRequirement, RequirementBook,
    Shortage, ShortageReason,
};
pub use inventory::StockTable;
pub use ledger::{Block, BlockFilter, BlockStatus, Transfer, TransferStatus, TransferType};
pub use normalize::{AliasResolver, MaterialMatch, MaterialNameResolver};
pub use notify::{
    Notification, NotificationKind, Notifier, NullNotifier, RecordingNotifier, Recipient,
    TracingNotifier,
};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use stage::{NextStage, RegistryError, Stage, StageRegistry};
pub use storage::{LedgerStore, MemoryStore, RedbStore};
pub use token::{SignedToken, TokenSigner, VerifiedToken};
