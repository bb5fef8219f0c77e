//! In-memory ledger store.

use super::{
    BlockWrite, CommitReceipt, LedgerStore, WriteBatch, apply_order_write, check_order_write,
    close_block, deactivate,
};
use crate::error::StoreError;
use crate::ledger::{Block, BlockFilter, Transfer};
use crate::token::TokenRecord;
use crate::types::{BlockId, OrderId, OrderRecord, StageIndex, TokenId, TransferId};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    orders: BTreeMap<OrderId, OrderRecord>,
    tokens: BTreeMap<TokenId, TokenRecord>,
    signatures: BTreeMap<String, TokenId>,
    transfers: BTreeMap<(OrderId, TransferId), Transfer>,
    blocks: BTreeMap<BlockId, Block>,
    active_blocks: BTreeMap<(OrderId, StageIndex, String), BlockId>,
    next_token: u64,
    next_transfer: u64,
    next_block: u64,
}

/// A store that lives and dies with the process.
///
/// Commits hold one mutex for validation and application, so they are
/// serialized; reads take the same mutex briefly.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Io("memory store lock poisoned".to_string()))
    }
}

impl LedgerStore for MemoryStore {
    fn order(&self, id: OrderId) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    fn token(&self, id: TokenId) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.lock()?.tokens.get(&id).cloned())
    }

    fn token_by_signature(&self, signature: &str) -> Result<Option<TokenRecord>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .signatures
            .get(signature)
            .and_then(|id| tables.tokens.get(id))
            .cloned())
    }

    fn transfers(&self, order: OrderId) -> Result<Vec<Transfer>, StoreError> {
        Ok(self
            .lock()?
            .transfers
            .range((order, TransferId(0))..=(order, TransferId(u64::MAX)))
            .map(|(_, t)| t.clone())
            .collect())
    }

    fn block(&self, id: BlockId) -> Result<Option<Block>, StoreError> {
        Ok(self.lock()?.blocks.get(&id).cloned())
    }

    fn blocks(&self, filter: &BlockFilter) -> Result<Vec<Block>, StoreError> {
        Ok(self
            .lock()?
            .blocks
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        batch.check_shape()?;
        if batch.is_empty() {
            return Ok(CommitReceipt::default());
        }
        let mut guard = self.lock()?;
        let tables = &mut *guard;

        // Validate everything before the first mutation.
        if let Some(write) = &batch.order {
            check_order_write(write, tables.orders.get(&write.order_id()))?;
        }
        for (id, _) in &batch.deactivate_tokens {
            if !tables.tokens.contains_key(id) {
                return Err(StoreError::Corrupt(format!("token {id} does not exist")));
            }
        }
        for write in &batch.blocks {
            if let BlockWrite::SetStatus { id, .. } = write {
                match tables.blocks.get(id) {
                    Some(block) if block.is_active() => {}
                    Some(_) => return Err(StoreError::BlockConflict(*id)),
                    None => return Err(StoreError::Corrupt(format!("block {id} does not exist"))),
                }
            }
        }

        let mut receipt = CommitReceipt::default();

        for (id, reason) in batch.deactivate_tokens {
            if let Some(token) = tables.tokens.get_mut(&id) {
                deactivate(token, reason);
            }
        }

        if let Some(new_token) = batch.new_token {
            tables.next_token += 1;
            let id = TokenId(tables.next_token);
            tables.signatures.insert(new_token.signature.clone(), id);
            tables.tokens.insert(id, new_token.into_record(id));
            receipt.token_id = Some(id);
        }

        if let Some(write) = batch.order {
            let id = write.order_id();
            let current = tables.orders.get(&id).cloned();
            let next = apply_order_write(write, current, receipt.token_id)?;
            receipt.order_version = Some(next.version);
            tables.orders.insert(id, next);
        }

        for transfer in batch.transfers {
            tables.next_transfer += 1;
            let id = TransferId(tables.next_transfer);
            tables
                .transfers
                .insert((transfer.order_id, id), transfer.into_transfer(id));
            receipt.transfer_ids.push(id);
        }

        for write in batch.blocks {
            match write {
                BlockWrite::Raise {
                    order,
                    stage,
                    shortage,
                    at,
                } => {
                    let key = (order, stage, shortage.material_name.clone());
                    let existing = tables.active_blocks.get(&key).copied();
                    let id = match existing.and_then(|id| tables.blocks.get_mut(&id)) {
                        Some(block) => {
                            block.refresh(&shortage);
                            block.id
                        }
                        None => {
                            tables.next_block += 1;
                            let id = BlockId(tables.next_block);
                            tables
                                .blocks
                                .insert(id, Block::raised(id, order, stage, &shortage, at));
                            tables.active_blocks.insert(key, id);
                            id
                        }
                    };
                    receipt.block_ids.push(id);
                }
                BlockWrite::SetStatus {
                    id,
                    status,
                    at,
                    notes,
                } => {
                    let Some(block) = tables.blocks.get_mut(&id) else {
                        return Err(StoreError::Corrupt(format!("block {id} does not exist")));
                    };
                    close_block(block, status, at, notes)?;
                    let key = (block.order_id, block.stage, block.material_name.clone());
                    tables.active_blocks.remove(&key);
                }
            }
        }

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{Shortage, ShortageReason};
    use crate::ledger::BlockStatus;
    use crate::storage::{OrderWrite, TokenSlot};
    use crate::token::{Deactivation, NewToken};
    use crate::types::{OperatorId, OrderPosition, Quantity};

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

    fn new_token(sig: &str) -> NewToken {
        NewToken {
            order_id: OrderId(1),
            stage_id: StageIndex(1),
            issued_at: 0,
            expires_at: 100,
            signature: sig.into(),
            issued_by: OperatorId::new("sup"),
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch {
                order: Some(OrderWrite::Insert(OrderRecord::new(
                    OrderId(1),
                    OrderPosition::AtStage {
                        stage: StageIndex(0),
                    },
                    0,
                ))),
                ..WriteBatch::new()
            })
            .expect("seed");
        store
    }

    fn issue(store: &MemoryStore, version: u64, sig: &str, old: Option<TokenId>) -> CommitReceipt {
        store
            .commit(WriteBatch {
                order: Some(OrderWrite::Update {
                    id: OrderId(1),
                    expected_version: version,
                    position: OrderPosition::AtStage {
                        stage: StageIndex(0),
                    },
                    active_token: TokenSlot::NewToken,
                    at: 1,
                }),
                new_token: Some(new_token(sig)),
                deactivate_tokens: old
                    .map(|id| vec![(id, Deactivation::Superseded)])
                    .unwrap_or_default(),
                ..WriteBatch::new()
            })
            .expect("issue")
    }

    #[test]
    fn token_issue_updates_pointer_and_index() {
        let store = seeded();
        let first = issue(&store, 0, "aa", None);
        let second = issue(&store, 1, "bb", first.token_id);

        let order = store.order(OrderId(1)).expect("read").expect("row");
        assert_eq!(order.active_token, second.token_id);
        assert_eq!(order.version, 2);

        let old = store.token_by_signature("aa").expect("read").expect("token");
        assert!(!old.is_active);
        assert_eq!(old.deactivation, Some(Deactivation::Superseded));
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let store = seeded();
        assert!(WriteBatch::new().is_empty());
        let receipt = store.commit(WriteBatch::new()).expect("empty commit");
        assert_eq!(receipt, CommitReceipt::default());
        assert_eq!(store.order(OrderId(1)).expect("read").expect("row").version, 0);
    }

    #[test]
    fn conflicting_batch_changes_nothing() {
        let store = seeded();
        issue(&store, 0, "aa", None);
        let stale = store.commit(WriteBatch {
            order: Some(OrderWrite::Update {
                id: OrderId(1),
                expected_version: 0,
                position: OrderPosition::AtStage {
                    stage: StageIndex(1),
                },
                active_token: TokenSlot::NewToken,
                at: 2,
            }),
            new_token: Some(new_token("cc")),
            ..WriteBatch::new()
        });
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));
        assert!(store.token_by_signature("cc").expect("read").is_none());
    }

    #[test]
    fn raise_is_idempotent_per_material() {
        let store = seeded();
        let raise = |missing| WriteBatch {
            blocks: vec![BlockWrite::Raise {
                order: OrderId(1),
                stage: StageIndex(2),
                shortage: shortage(missing),
                at: 3,
            }],
            ..WriteBatch::new()
        };
        let a = store.commit(raise(4)).expect("raise");
        let b = store.commit(raise(2)).expect("raise again");
        assert_eq!(a.block_ids, b.block_ids);
        let active = store.blocks(&BlockFilter::active()).expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].missing_quantity, Quantity::from_units(2));
    }

    #[test]
    fn closing_twice_conflicts() {
        let store = seeded();
        let receipt = store
            .commit(WriteBatch {
                blocks: vec![BlockWrite::Raise {
                    order: OrderId(1),
                    stage: StageIndex(2),
                    shortage: shortage(4),
                    at: 3,
                }],
                ..WriteBatch::new()
            })
            .expect("raise");
        let close = || WriteBatch {
            blocks: vec![BlockWrite::SetStatus {
                id: receipt.block_ids[0],
                status: BlockStatus::Resolved,
                at: 4,
                notes: None,
            }],
            ..WriteBatch::new()
        };
        store.commit(close()).expect("first close");
        assert!(matches!(
            store.commit(close()),
            Err(StoreError::BlockConflict(_))
        ));
    }
}
