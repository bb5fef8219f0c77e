//! # Transfer and Block Ledger
//!
//! Record types for the audit trail. Transfers are append-only; blocks only
//! ever move out of `Active` (to `Resolved` or `Ignored`), never back.

use crate::gate::{Shortage, ShortageReason};
use crate::types::{BlockId, OperatorId, OrderId, Quantity, StageIndex, TransferId};
use serde::{Deserialize, Serialize};

// =============================================================================
// TRANSFERS
// =============================================================================

/// What a transfer record documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// A checkpoint token was issued; the physical handoff has not happened yet.
    Pending,
    /// A station scanned the token and took the order.
    Confirmed,
    /// Work at a stage was marked finished.
    Ready,
    /// The order was sent back to an earlier stage.
    Rework,
    /// The order left the building.
    Shipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Normal,
    Rework,
}

/// Immutable audit record of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub order_id: OrderId,
    pub from_stage: Option<StageIndex>,
    pub to_stage: Option<StageIndex>,
    pub scanned_by: OperatorId,
    pub status: TransferStatus,
    pub transfer_type: TransferType,
    pub notes: Option<String>,
    pub created_at: u64,
}

/// A transfer waiting for its id inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransfer {
    pub order_id: OrderId,
    pub from_stage: Option<StageIndex>,
    pub to_stage: Option<StageIndex>,
    pub scanned_by: OperatorId,
    pub status: TransferStatus,
    pub transfer_type: TransferType,
    pub notes: Option<String>,
    pub created_at: u64,
}

impl NewTransfer {
    #[must_use]
    pub fn into_transfer(self, id: TransferId) -> Transfer {
        Transfer {
            id,
            order_id: self.order_id,
            from_stage: self.from_stage,
            to_stage: self.to_stage,
            scanned_by: self.scanned_by,
            status: self.status,
            transfer_type: self.transfer_type,
            notes: self.notes,
            created_at: self.created_at,
        }
    }
}

// =============================================================================
// BLOCKS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Active,
    Resolved,
    Ignored,
}

impl std::str::FromStr for BlockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "resolved" => Ok(Self::Resolved),
            "ignored" => Ok(Self::Ignored),
            other => Err(format!("unknown block status '{other}'")),
        }
    }
}

/// A recorded material shortage for one (order, stage, material).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub order_id: OrderId,
    pub stage: StageIndex,
    pub material_name: String,
    pub unit: String,
    pub required_quantity: Quantity,
    pub available_quantity: Quantity,
    pub missing_quantity: Quantity,
    pub reason: ShortageReason,
    pub status: BlockStatus,
    pub blocked_at: u64,
    pub resolved_at: Option<u64>,
    pub notes: Option<String>,
}

impl Block {
    /// A new active block raised from a gate shortage.
    #[must_use]
    pub fn raised(id: BlockId, order_id: OrderId, stage: StageIndex, shortage: &Shortage, at: u64) -> Self {
        Self {
            id,
            order_id,
            stage,
            material_name: shortage.material_name.clone(),
            unit: shortage.unit.clone(),
            required_quantity: shortage.required,
            available_quantity: shortage.available,
            missing_quantity: shortage.missing,
            reason: shortage.reason,
            status: BlockStatus::Active,
            blocked_at: at,
            resolved_at: None,
            notes: None,
        }
    }

    /// Refresh quantities of an existing active block from a newer shortage.
    pub fn refresh(&mut self, shortage: &Shortage) {
        self.unit.clone_from(&shortage.unit);
        self.required_quantity = shortage.required;
        self.available_quantity = shortage.available;
        self.missing_quantity = shortage.missing;
        self.reason = shortage.reason;
    }

    /// Move out of `Active`.
    pub fn close(&mut self, status: BlockStatus, at: u64, notes: Option<String>) {
        self.status = status;
        self.resolved_at = Some(at);
        self.notes = notes;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == BlockStatus::Active
    }
}

/// Filter for block listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFilter {
    pub order_id: Option<OrderId>,
    pub stage: Option<StageIndex>,
    pub status: Option<BlockStatus>,
}

impl BlockFilter {
    /// Active blocks, optionally narrowed to one order and stage.
    #[must_use]
    pub fn active() -> Self {
        Self {
            status: Some(BlockStatus::Active),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_order(mut self, order: OrderId) -> Self {
        self.order_id = Some(order);
        self
    }

    #[must_use]
    pub fn for_stage(mut self, stage: StageIndex) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn matches(&self, block: &Block) -> bool {
        self.order_id.is_none_or(|o| o == block.order_id)
            && self.stage.is_none_or(|s| s == block.stage)
            && self.status.is_none_or(|s| s == block.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shortage(missing: i64) -> Shortage {
        Shortage {
            material_name: "Foam-35".into(),
            unit: "sheet".into(),
            required: Quantity::from_units(10),
            available: Quantity::from_units(10 - missing),
            missing: Quantity::from_units(missing),
            reason: ShortageReason::Insufficient,
        }
    }

    #[test]
    fn refresh_updates_quantities_only() {
        let mut block = Block::raised(BlockId(1), OrderId(7), StageIndex(2), &shortage(4), 100);
        block.refresh(&shortage(1));
        assert_eq!(block.missing_quantity, Quantity::from_units(1));
        assert_eq!(block.blocked_at, 100);
        assert!(block.is_active());
    }

    #[test]
    fn close_records_time_and_notes() {
        let mut block = Block::raised(BlockId(1), OrderId(7), StageIndex(2), &shortage(4), 100);
        block.close(BlockStatus::Ignored, 150, Some("use offcuts".into()));
        assert_eq!(block.status, BlockStatus::Ignored);
        assert_eq!(block.resolved_at, Some(150));
    }

    #[test]
    fn filter_matches_on_every_set_field() {
        let block = Block::raised(BlockId(1), OrderId(7), StageIndex(2), &shortage(4), 100);
        assert!(BlockFilter::default().matches(&block));
        assert!(BlockFilter::active().for_order(OrderId(7)).matches(&block));
        assert!(!BlockFilter::active().for_stage(StageIndex(3)).matches(&block));
        let resolved = BlockFilter {
            status: Some(BlockStatus::Resolved),
            ..BlockFilter::default()
        };
        assert!(!resolved.matches(&block));
    }

    #[test]
    fn block_status_parses_case_insensitively() {
        assert_eq!("Ignored".parse::<BlockStatus>(), Ok(BlockStatus::Ignored));
        assert!("open".parse::<BlockStatus>().is_err());
    }
}
