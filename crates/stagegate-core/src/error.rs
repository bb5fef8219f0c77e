//! # Error Types
//!
//! - No silent failures: every fallible operation returns `Result`.
//! - Every error carries a stable `reason_code()` for callers that need a
//!   machine-readable rejection reason.
//! - Only store write conflicts are transient; everything else is terminal.

use crate::auth::Capability;
use crate::types::{BlockId, OrderId, OrderPosition, StageIndex};
use thiserror::Error;

// =============================================================================
// STORE ERRORS
// =============================================================================

/// Errors reported by a [`crate::storage::LedgerStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Another unit of work changed the order row after it was read.
    #[error("Write conflict on order {order}: expected version {expected}, found {found}")]
    Conflict {
        order: OrderId,
        expected: u64,
        found: u64,
    },

    /// A block changed status after it was read.
    #[error("Write conflict on block {0}: no longer active")]
    BlockConflict(BlockId),

    /// The underlying database failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A row could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store contents violate an invariant (dangling index, missing row).
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the whole unit of work may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::BlockConflict(_))
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } | Self::BlockConflict(_) => "store_conflict",
            Self::Io(_) => "store_io",
            Self::Serialization(_) => "store_serialization",
            Self::Corrupt(_) => "store_corrupt",
        }
    }
}

// =============================================================================
// TOKEN ERRORS
// =============================================================================

/// Terminal failures of checkpoint token verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Malformed checkpoint token: {0}")]
    Malformed(String),

    #[error("Checkpoint token signature does not match its contents")]
    Tampered,

    #[error("Checkpoint token expired {age_secs}s after issue (limit {max_lifetime_secs}s)")]
    Expired { age_secs: u64, max_lifetime_secs: u64 },

    #[error("Checkpoint token has already been used")]
    AlreadyConsumed,

    #[error("Checkpoint token was superseded by a newer one")]
    Superseded,

    #[error("Checkpoint token is not known to this store")]
    Unknown,
}

impl TokenError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_token",
            Self::Tampered => "tampered_token",
            Self::Expired { .. } => "expired_token",
            Self::AlreadyConsumed => "token_already_consumed",
            Self::Superseded => "token_superseded",
            Self::Unknown => "unknown_token",
        }
    }
}

// =============================================================================
// ENGINE ERRORS
// =============================================================================

/// Errors returned by the stage transition engine.
///
/// Material shortages are not errors; they come back as structured outcomes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Order {order} cannot {action} while {position}")]
    InvalidTransition {
        order: OrderId,
        position: OrderPosition,
        action: &'static str,
    },

    #[error("Order {order} is at {actual:?}, not stage {claimed}")]
    StageMismatch {
        order: OrderId,
        claimed: StageIndex,
        actual: Option<StageIndex>,
    },

    #[error("Unknown block: {0}")]
    UnknownBlock(BlockId),

    #[error("Block {0} is no longer active")]
    BlockNotActive(BlockId),

    #[error("Missing capability: {0}")]
    Unauthorized(Capability),

    #[error("Operator is restricted to stage {allowed}, not {requested}")]
    StageRestricted {
        allowed: StageIndex,
        requested: StageIndex,
    },

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Gave up after {attempts} conflicting attempts")]
    ConcurrencyExhausted { attempts: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownOrder(_) => "unknown_order",
            Self::UnknownStage(_) => "unknown_stage",
            Self::InvalidField { .. } => "invalid_field",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::StageMismatch { .. } => "stage_mismatch",
            Self::UnknownBlock(_) => "unknown_block",
            Self::BlockNotActive(_) => "block_not_active",
            Self::Unauthorized(_) => "unauthorized",
            Self::StageRestricted { .. } => "stage_restricted",
            Self::Token(e) => e.reason_code(),
            Self::ConcurrencyExhausted { .. } => "concurrency_exhausted",
            Self::Store(e) => e.reason_code(),
        }
    }

    /// Whether the retry wrapper should run the unit of work again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_transient() {
        let conflict = EngineError::Store(StoreError::Conflict {
            order: OrderId(1),
            expected: 1,
            found: 2,
        });
        assert!(conflict.is_transient());
        assert!(!EngineError::Store(StoreError::Io("disk".into())).is_transient());
        assert!(!EngineError::Token(TokenError::Tampered).is_transient());
    }

    #[test]
    fn token_reason_codes_pass_through() {
        let err = EngineError::from(TokenError::AlreadyConsumed);
        assert_eq!(err.reason_code(), "token_already_consumed");
    }

    #[test]
    fn invalid_field_names_the_field() {
        let err = EngineError::invalid("notes", "too long");
        assert_eq!(err.to_string(), "Invalid notes: too long");
    }
}
