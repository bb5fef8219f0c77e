//! # redb-backed Ledger Store
//!
//! Persists the ledger in a single redb file. Rows are postcard-encoded;
//! secondary indexes and id counters live in their own tables so that every
//! lookup the engine makes is a point read or a prefix range.
//!
//! Each [`WriteBatch`] runs in exactly one write transaction. redb allows a
//! single writer at a time, so the version check and the writes it guards
//! cannot interleave with another commit. A batch that fails part-way drops
//! its transaction uncommitted.

use super::{
    BlockWrite, CommitReceipt, LedgerStore, WriteBatch, apply_order_write, check_order_write,
    close_block, deactivate,
};
use crate::error::StoreError;
use crate::ledger::{Block, BlockFilter, Transfer};
use crate::token::TokenRecord;
use crate::types::{BlockId, OrderId, OrderRecord, TokenId, TransferId};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Order rows: OrderId -> OrderRecord
const ORDERS: TableDefinition<u64, &[u8]> = TableDefinition::new("orders");

/// Token rows: TokenId -> TokenRecord
const TOKENS: TableDefinition<u64, &[u8]> = TableDefinition::new("tokens");

/// Signature index: hex signature -> TokenId
const TOKEN_SIGNATURES: TableDefinition<&str, u64> = TableDefinition::new("token_signatures");

/// Transfers: (OrderId, TransferId) -> Transfer, so one order is a prefix range.
const TRANSFERS: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("transfers");

/// Block rows: BlockId -> Block
const BLOCKS: TableDefinition<u64, &[u8]> = TableDefinition::new("blocks");

/// Block index: (OrderId, StageIndex, BlockId), so one order or one
/// (order, stage) pair is a prefix range.
const ORDER_BLOCKS: TableDefinition<(u64, u32, u64), ()> = TableDefinition::new("order_blocks");

/// Active block index: (OrderId, StageIndex, material) -> BlockId
const ACTIVE_BLOCKS: TableDefinition<(u64, u32, &str), u64> = TableDefinition::new("active_blocks");

/// Id counters: name -> last assigned id
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_TOKEN: &str = "next_token_id";
const NEXT_TRANSFER: &str = "next_transfer_id";
const NEXT_BLOCK: &str = "next_block_id";

fn io(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// A disk-backed ledger.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a ledger database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let write_txn = db.begin_write().map_err(io)?;
        {
            let _ = write_txn.open_table(ORDERS).map_err(io)?;
            let _ = write_txn.open_table(TOKENS).map_err(io)?;
            let _ = write_txn.open_table(TOKEN_SIGNATURES).map_err(io)?;
            let _ = write_txn.open_table(TRANSFERS).map_err(io)?;
            let _ = write_txn.open_table(BLOCKS).map_err(io)?;
            let _ = write_txn.open_table(ORDER_BLOCKS).map_err(io)?;
            let _ = write_txn.open_table(ACTIVE_BLOCKS).map_err(io)?;
            let _ = write_txn.open_table(METADATA).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;

        tracing::debug!(path = %path.as_ref().display(), "opened redb ledger");
        Ok(Self { db })
    }

    fn read_row<T: DeserializeOwned>(
        &self,
        table: TableDefinition<u64, &[u8]>,
        key: u64,
    ) -> Result<Option<T>, StoreError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(table).map_err(io)?;
        match table.get(key).map_err(io)? {
            Some(guard) => decode(guard.value()).map(Some),
            None => Ok(None),
        }
    }
}

/// Bump and return a counter inside a write transaction.
fn next_id(txn: &WriteTransaction, counter: &str) -> Result<u64, StoreError> {
    let mut meta = txn.open_table(METADATA).map_err(io)?;
    let current = meta.get(counter).map_err(io)?.map(|v| v.value()).unwrap_or(0);
    let next = current.saturating_add(1);
    meta.insert(counter, next).map_err(io)?;
    Ok(next)
}

fn apply(txn: &WriteTransaction, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
    let mut receipt = CommitReceipt::default();

    // The order row first: a stale version aborts before anything else moves.
    let current_order = match &batch.order {
        Some(write) => {
            let orders = txn.open_table(ORDERS).map_err(io)?;
            let current: Option<OrderRecord> = match orders.get(write.order_id().0).map_err(io)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            check_order_write(write, current.as_ref())?;
            current
        }
        None => None,
    };

    {
        let mut tokens = txn.open_table(TOKENS).map_err(io)?;
        for (id, reason) in batch.deactivate_tokens {
            let mut token: TokenRecord = match tokens.get(id.0).map_err(io)? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StoreError::Corrupt(format!("token {id} does not exist"))),
            };
            deactivate(&mut token, reason);
            tokens.insert(id.0, encode(&token)?.as_slice()).map_err(io)?;
        }
    }

    if let Some(new_token) = batch.new_token {
        let id = TokenId(next_id(txn, NEXT_TOKEN)?);
        let mut signatures = txn.open_table(TOKEN_SIGNATURES).map_err(io)?;
        signatures
            .insert(new_token.signature.as_str(), id.0)
            .map_err(io)?;
        let mut tokens = txn.open_table(TOKENS).map_err(io)?;
        let record = new_token.into_record(id);
        tokens.insert(id.0, encode(&record)?.as_slice()).map_err(io)?;
        receipt.token_id = Some(id);
    }

    if let Some(write) = batch.order {
        let id = write.order_id();
        let next = apply_order_write(write, current_order, receipt.token_id)?;
        let mut orders = txn.open_table(ORDERS).map_err(io)?;
        orders.insert(id.0, encode(&next)?.as_slice()).map_err(io)?;
        receipt.order_version = Some(next.version);
    }

    for transfer in batch.transfers {
        let id = TransferId(next_id(txn, NEXT_TRANSFER)?);
        let order = transfer.order_id;
        let row = encode(&transfer.into_transfer(id))?;
        let mut transfers = txn.open_table(TRANSFERS).map_err(io)?;
        transfers
            .insert((order.0, id.0), row.as_slice())
            .map_err(io)?;
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
                let existing = {
                    let index = txn.open_table(ACTIVE_BLOCKS).map_err(io)?;
                    let found = index
                        .get((order.0, stage.0, shortage.material_name.as_str()))
                        .map_err(io)?
                        .map(|v| v.value());
                    found
                };
                let block = match existing {
                    Some(raw_id) => {
                        let blocks = txn.open_table(BLOCKS).map_err(io)?;
                        let mut block: Block = match blocks.get(raw_id).map_err(io)? {
                            Some(guard) => decode(guard.value())?,
                            None => {
                                return Err(StoreError::Corrupt(format!(
                                    "active index points at missing block {raw_id}"
                                )));
                            }
                        };
                        block.refresh(&shortage);
                        block
                    }
                    None => {
                        let id = BlockId(next_id(txn, NEXT_BLOCK)?);
                        let mut index = txn.open_table(ACTIVE_BLOCKS).map_err(io)?;
                        index
                            .insert((order.0, stage.0, shortage.material_name.as_str()), id.0)
                            .map_err(io)?;
                        let mut by_order = txn.open_table(ORDER_BLOCKS).map_err(io)?;
                        by_order.insert((order.0, stage.0, id.0), ()).map_err(io)?;
                        Block::raised(id, order, stage, &shortage, at)
                    }
                };
                let mut blocks = txn.open_table(BLOCKS).map_err(io)?;
                blocks
                    .insert(block.id.0, encode(&block)?.as_slice())
                    .map_err(io)?;
                receipt.block_ids.push(block.id);
            }
            BlockWrite::SetStatus {
                id,
                status,
                at,
                notes,
            } => {
                let mut blocks = txn.open_table(BLOCKS).map_err(io)?;
                let mut block: Block = match blocks.get(id.0).map_err(io)? {
                    Some(guard) => decode(guard.value())?,
                    None => return Err(StoreError::Corrupt(format!("block {id} does not exist"))),
                };
                close_block(&mut block, status, at, notes)?;
                blocks
                    .insert(id.0, encode(&block)?.as_slice())
                    .map_err(io)?;
                let mut index = txn.open_table(ACTIVE_BLOCKS).map_err(io)?;
                index
                    .remove((block.order_id.0, block.stage.0, block.material_name.as_str()))
                    .map_err(io)?;
            }
        }
    }

    Ok(receipt)
}

impl LedgerStore for RedbStore {
    fn order(&self, id: OrderId) -> Result<Option<OrderRecord>, StoreError> {
        self.read_row(ORDERS, id.0)
    }

    fn token(&self, id: TokenId) -> Result<Option<TokenRecord>, StoreError> {
        self.read_row(TOKENS, id.0)
    }

    fn token_by_signature(&self, signature: &str) -> Result<Option<TokenRecord>, StoreError> {
        let id = {
            let read_txn = self.db.begin_read().map_err(io)?;
            let index = read_txn.open_table(TOKEN_SIGNATURES).map_err(io)?;
            let found = index.get(signature).map_err(io)?.map(|v| v.value());
            found
        };
        match id {
            Some(id) => self.read_row(TOKENS, id),
            None => Ok(None),
        }
    }

    fn transfers(&self, order: OrderId) -> Result<Vec<Transfer>, StoreError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(TRANSFERS).map_err(io)?;
        let mut out = Vec::new();
        for entry in table
            .range((order.0, 0u64)..=(order.0, u64::MAX))
            .map_err(io)?
        {
            let (_key, value) = entry.map_err(io)?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    fn block(&self, id: BlockId) -> Result<Option<Block>, StoreError> {
        self.read_row(BLOCKS, id.0)
    }

    fn blocks(&self, filter: &BlockFilter) -> Result<Vec<Block>, StoreError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(BLOCKS).map_err(io)?;

        let Some(order) = filter.order_id else {
            let mut out = Vec::new();
            for entry in table.iter().map_err(io)? {
                let (_key, value) = entry.map_err(io)?;
                let block: Block = decode(value.value())?;
                if filter.matches(&block) {
                    out.push(block);
                }
            }
            return Ok(out);
        };

        let (low, high) = filter.stage.map_or((0, u32::MAX), |s| (s.0, s.0));
        let index = read_txn.open_table(ORDER_BLOCKS).map_err(io)?;
        let mut ids = Vec::new();
        for entry in index
            .range((order.0, low, 0u64)..=(order.0, high, u64::MAX))
            .map_err(io)?
        {
            let (key, _) = entry.map_err(io)?;
            ids.push(key.value().2);
        }
        ids.sort_unstable();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let block: Block = match table.get(id).map_err(io)? {
                Some(guard) => decode(guard.value())?,
                None => {
                    return Err(StoreError::Corrupt(format!(
                        "block index points at missing block {id}"
                    )));
                }
            };
            if filter.matches(&block) {
                out.push(block);
            }
        }
        Ok(out)
    }

    fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        batch.check_shape()?;
        if batch.is_empty() {
            return Ok(CommitReceipt::default());
        }
        let write_txn = self.db.begin_write().map_err(io)?;
        let receipt = apply(&write_txn, batch)?;
        write_txn.commit().map_err(io)?;
        Ok(receipt)
    }
}
