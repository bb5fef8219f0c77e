//! # Ledger Storage
//!
//! The authoritative store for order rows, tokens, transfers and blocks.
//!
//! Reads are plain lookups. Every mutation goes through
//! [`LedgerStore::commit`], which applies a whole [`WriteBatch`] atomically
//! or nothing at all. The order row carries a version; an update naming a
//! stale version fails with [`StoreError::Conflict`], which the retry
//! wrapper treats as transient.
//!
//! Two implementations:
//! - [`MemoryStore`]: a mutex-guarded set of maps, for tests and dry runs
//! - [`RedbStore`]: redb on disk, one write transaction per batch

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::error::StoreError;
use crate::gate::Shortage;
use crate::ledger::{Block, BlockFilter, BlockStatus, NewTransfer, Transfer};
use crate::token::{Deactivation, NewToken, TokenRecord};
use crate::types::{BlockId, OrderId, OrderPosition, OrderRecord, StageIndex, TokenId, TransferId};

// =============================================================================
// WRITE BATCH
// =============================================================================

/// What to do with the order's active token pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSlot {
    Clear,
    /// Point at the token inserted by the same batch.
    NewToken,
}

/// A change to the single order row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderWrite {
    /// Create the row. Fails with a conflict if it already exists.
    Insert(OrderRecord),
    /// Move the row from `expected_version` to the next version.
    Update {
        id: OrderId,
        expected_version: u64,
        position: OrderPosition,
        active_token: TokenSlot,
        at: u64,
    },
}

impl OrderWrite {
    #[must_use]
    pub fn order_id(&self) -> OrderId {
        match self {
            Self::Insert(record) => record.id,
            Self::Update { id, .. } => *id,
        }
    }
}

/// A change to the block ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockWrite {
    /// Raise a block, or refresh the active one for the same
    /// (order, stage, material).
    Raise {
        order: OrderId,
        stage: StageIndex,
        shortage: Shortage,
        at: u64,
    },
    /// Close an active block. Fails with a conflict if it is no longer active.
    SetStatus {
        id: BlockId,
        status: BlockStatus,
        at: u64,
        notes: Option<String>,
    },
}

/// One atomic unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub order: Option<OrderWrite>,
    pub new_token: Option<NewToken>,
    pub deactivate_tokens: Vec<(TokenId, Deactivation)>,
    pub transfers: Vec<NewTransfer>,
    pub blocks: Vec<BlockWrite>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_none()
            && self.new_token.is_none()
            && self.deactivate_tokens.is_empty()
            && self.transfers.is_empty()
            && self.blocks.is_empty()
    }

    /// Reject batches whose parts do not fit together.
    pub(crate) fn check_shape(&self) -> Result<(), StoreError> {
        let wants_token = matches!(
            self.order,
            Some(OrderWrite::Update {
                active_token: TokenSlot::NewToken,
                ..
            })
        );
        if wants_token != self.new_token.is_some() {
            return Err(StoreError::Corrupt(
                "a new token must be inserted together with the order pointer update".to_string(),
            ));
        }
        let mut closing = std::collections::BTreeSet::new();
        for write in &self.blocks {
            if let BlockWrite::SetStatus { id, .. } = write {
                if !closing.insert(*id) {
                    return Err(StoreError::Corrupt(format!("block {id} closed twice in one batch")));
                }
            }
        }
        Ok(())
    }
}

/// Identifiers assigned by a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    pub token_id: Option<TokenId>,
    pub transfer_ids: Vec<TransferId>,
    /// Blocks raised or refreshed by the batch, in batch order.
    pub block_ids: Vec<BlockId>,
    pub order_version: Option<u64>,
}

// =============================================================================
// STORE TRAIT
// =============================================================================

pub trait LedgerStore: Send + Sync {
    fn order(&self, id: OrderId) -> Result<Option<OrderRecord>, StoreError>;

    fn token(&self, id: TokenId) -> Result<Option<TokenRecord>, StoreError>;

    fn token_by_signature(&self, signature: &str) -> Result<Option<TokenRecord>, StoreError>;

    /// Transfers of one order in commit order.
    fn transfers(&self, order: OrderId) -> Result<Vec<Transfer>, StoreError>;

    fn block(&self, id: BlockId) -> Result<Option<Block>, StoreError>;

    /// Blocks matching `filter`, ordered by id.
    fn blocks(&self, filter: &BlockFilter) -> Result<Vec<Block>, StoreError>;

    /// Apply `batch` atomically.
    fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError>;
}

/// Check an order write against the row currently stored.
pub(crate) fn check_order_write(
    write: &OrderWrite,
    current: Option<&OrderRecord>,
) -> Result<(), StoreError> {
    match (write, current) {
        (OrderWrite::Insert(record), Some(existing)) => Err(StoreError::Conflict {
            order: record.id,
            expected: record.version,
            found: existing.version,
        }),
        (OrderWrite::Insert(_), None) => Ok(()),
        (OrderWrite::Update { id, .. }, None) => {
            Err(StoreError::Corrupt(format!("order {id} has no row to update")))
        }
        (
            OrderWrite::Update {
                id,
                expected_version,
                ..
            },
            Some(existing),
        ) if existing.version != *expected_version => Err(StoreError::Conflict {
            order: *id,
            expected: *expected_version,
            found: existing.version,
        }),
        (OrderWrite::Update { .. }, Some(_)) => Ok(()),
    }
}

/// The row an order write produces.
pub(crate) fn apply_order_write(
    write: OrderWrite,
    current: Option<OrderRecord>,
    new_token: Option<TokenId>,
) -> Result<OrderRecord, StoreError> {
    match write {
        OrderWrite::Insert(record) => Ok(record),
        OrderWrite::Update {
            id,
            position,
            active_token,
            at,
            ..
        } => {
            let mut record = current
                .ok_or_else(|| StoreError::Corrupt(format!("order {id} has no row to update")))?;
            record.position = position;
            record.active_token = match active_token {
                TokenSlot::Clear => None,
                TokenSlot::NewToken => new_token,
            };
            record.version = record.version.saturating_add(1);
            record.updated_at = at;
            Ok(record)
        }
    }
}

/// Close a block row or report that it moved on.
pub(crate) fn close_block(
    block: &mut Block,
    status: BlockStatus,
    at: u64,
    notes: Option<String>,
) -> Result<(), StoreError> {
    if !block.is_active() {
        return Err(StoreError::BlockConflict(block.id));
    }
    block.close(status, at, notes);
    Ok(())
}

/// Deactivate a token row. The first deactivation reason sticks.
pub(crate) fn deactivate(token: &mut TokenRecord, reason: Deactivation) {
    if token.is_active {
        token.is_active = false;
        token.deactivation = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u64) -> OrderRecord {
        let mut r = OrderRecord::new(OrderId(1), OrderPosition::Unassigned, 0);
        r.version = version;
        r
    }

    fn update(expected_version: u64, slot: TokenSlot) -> OrderWrite {
        OrderWrite::Update {
            id: OrderId(1),
            expected_version,
            position: OrderPosition::AtStage {
                stage: StageIndex(0),
            },
            active_token: slot,
            at: 5,
        }
    }

    #[test]
    fn stale_version_conflicts() {
        let err = check_order_write(&update(1, TokenSlot::Clear), Some(&record(2)));
        assert!(matches!(err, Err(StoreError::Conflict { expected: 1, found: 2, .. })));
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let err = check_order_write(&OrderWrite::Insert(record(0)), Some(&record(0)));
        assert!(err.is_err_and(|e| e.is_transient()));
    }

    #[test]
    fn update_bumps_version_and_sets_pointer() {
        let next = apply_order_write(
            update(2, TokenSlot::NewToken),
            Some(record(2)),
            Some(TokenId(7)),
        )
        .expect("apply");
        assert_eq!(next.version, 3);
        assert_eq!(next.active_token, Some(TokenId(7)));
        assert_eq!(next.updated_at, 5);
    }

    #[test]
    fn new_token_slot_needs_a_token() {
        let batch = WriteBatch {
            order: Some(update(0, TokenSlot::NewToken)),
            ..WriteBatch::new()
        };
        assert!(matches!(batch.check_shape(), Err(StoreError::Corrupt(_))));
        assert!(WriteBatch::new().check_shape().is_ok());
    }
}
