//! # Core Type Definitions
//!
//! Identifiers and the per-order aggregate shared by every other module:
//! - Identifiers (`OrderId`, `StageIndex`, `TokenId`, `TransferId`, `BlockId`, `OperatorId`)
//! - Order position in the pipeline (`OrderPosition`)
//! - The single-row-per-order aggregate (`OrderRecord`)
//!
//! ## Determinism Guarantees
//!
//! All identifiers implement `Ord` so they can key `BTreeMap`s and redb
//! tables, and all counters use saturating arithmetic.

mod quantity;

pub use quantity::{Quantity, QuantityParseError};

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of a production order, owned by the order-management system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

/// Position of a stage in the production pipeline.
///
/// Active stages are numbered densely from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageIndex(pub u32);

impl StageIndex {
    /// The stage index following this one, saturating at `u32::MAX`.
    #[must_use]
    pub const fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Store-assigned identifier of an issued checkpoint token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u64);

/// Store-assigned identifier of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

/// Store-assigned identifier of a material block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

/// Identifier of an operator or supervisor, supplied by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(pub String);

impl OperatorId {
    /// Create an operator id from a string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(
            impl std::fmt::Display for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_inner!(OrderId, StageIndex, TokenId, TransferId, BlockId, OperatorId);

// =============================================================================
// ORDER POSITION
// =============================================================================

/// Where an order sits in the pipeline.
///
/// `ReadyToShip` and `Shipped` remember the last working stage so that the
/// audit trail can point at it. Externally tagged so the binary row codec
/// can decode it without self-description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPosition {
    /// Registered but not yet handed to any station.
    Unassigned,
    /// Currently worked at the given stage.
    AtStage { stage: StageIndex },
    /// Finished the last stage, waiting for shipment.
    ReadyToShip { last_stage: StageIndex },
    /// Left the building. Terminal.
    Shipped { last_stage: StageIndex },
}

impl OrderPosition {
    /// The stage the order is physically at, if it is inside the pipeline.
    #[must_use]
    pub fn current_stage(&self) -> Option<StageIndex> {
        match self {
            Self::AtStage { stage } => Some(*stage),
            Self::Unassigned | Self::ReadyToShip { .. } | Self::Shipped { .. } => None,
        }
    }

    /// The most recent stage the order worked at, including terminal positions.
    #[must_use]
    pub fn last_stage(&self) -> Option<StageIndex> {
        match self {
            Self::Unassigned => None,
            Self::AtStage { stage } => Some(*stage),
            Self::ReadyToShip { last_stage } | Self::Shipped { last_stage } => Some(*last_stage),
        }
    }

    /// Short label used in logs and error messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::AtStage { .. } => "at_stage",
            Self::ReadyToShip { .. } => "ready_to_ship",
            Self::Shipped { .. } => "shipped",
        }
    }
}

impl std::fmt::Display for OrderPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.last_stage() {
            Some(stage) => write!(f, "{}({})", self.label(), stage),
            None => write!(f, "{}", self.label()),
        }
    }
}

// =============================================================================
// ORDER RECORD
// =============================================================================

/// The per-order aggregate this engine owns: stage pointer, active token and
/// an optimistic-concurrency version.
///
/// Every commit that touches an order must name the version it read; the
/// store rejects the commit with a conflict if the row moved in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub position: OrderPosition,
    pub active_token: Option<TokenId>,
    pub version: u64,
    pub updated_at: u64,
}

impl OrderRecord {
    /// A freshly registered order at version 0.
    #[must_use]
    pub fn new(id: OrderId, position: OrderPosition, now: u64) -> Self {
        Self {
            id,
            position,
            active_token: None,
            version: 0,
            updated_at: now,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_current_stage_only_inside_pipeline() {
        assert_eq!(OrderPosition::Unassigned.current_stage(), None);
        assert_eq!(
            OrderPosition::AtStage {
                stage: StageIndex(2)
            }
            .current_stage(),
            Some(StageIndex(2))
        );
        assert_eq!(
            OrderPosition::ReadyToShip {
                last_stage: StageIndex(4)
            }
            .current_stage(),
            None
        );
    }

    #[test]
    fn position_last_stage_survives_terminal_states() {
        let shipped = OrderPosition::Shipped {
            last_stage: StageIndex(5),
        };
        assert_eq!(shipped.last_stage(), Some(StageIndex(5)));
        assert_eq!(shipped.to_string(), "shipped(5)");
    }

    #[test]
    fn position_serializes_externally_tagged() {
        let json = serde_json::to_string(&OrderPosition::AtStage {
            stage: StageIndex(1),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"at_stage":{"stage":1}}"#);
        let unassigned = serde_json::to_string(&OrderPosition::Unassigned).expect("serialize");
        assert_eq!(unassigned, r#""unassigned""#);
    }

    #[test]
    fn stage_index_successor_saturates() {
        assert_eq!(StageIndex(u32::MAX).successor(), StageIndex(u32::MAX));
        assert_eq!(StageIndex(0).successor(), StageIndex(1));
    }
}
