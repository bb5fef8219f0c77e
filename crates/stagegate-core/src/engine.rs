//! # Stage Transition Engine
//!
//! The state machine that moves orders through the pipeline.
//!
//! ```text
//! Unassigned --confirm--> AtStage(n) --confirm--> AtStage(m)   (m > n)
//!                            |  ^
//!                 mark_ready |  | return_for_rework (to < from)
//!                            v  |
//!                         AtStage(n+1) ... AtStage(last) --mark_ready--> ReadyToShip --ship--> Shipped
//! ```
//!
//! Every mutating operation is one retryable unit of work: read the order
//! row, decide, build a [`WriteBatch`] naming the version that was read, and
//! commit. A concurrent change to the same order fails the commit with a
//! conflict and the whole unit runs again against fresh state.
//!
//! Material shortages are outcomes, not errors. A blocked unit still commits
//! its block records but never touches the order row or its token.
//!
//! Notifications go out only after a successful commit.

use crate::auth::{Capability, Principal};
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, StoreError, TokenError};
use crate::gate::{GateDecision, GateReport, MaterialGate};
use crate::ledger::{Block, BlockFilter, BlockStatus, NewTransfer, Transfer, TransferStatus, TransferType};
use crate::notify::{Notification, NotificationKind, Notifier, Recipient, TracingNotifier};
use crate::primitives::MAX_NOTES_LENGTH;
use crate::retry::RetryPolicy;
use crate::stage::{NextStage, StageRegistry};
use crate::storage::{BlockWrite, LedgerStore, OrderWrite, TokenSlot, WriteBatch};
use crate::token::{Deactivation, NewToken, SignedToken, TokenSigner};
use crate::types::{BlockId, OrderId, OrderPosition, OrderRecord, StageIndex, TokenId};
use serde::Serialize;
use std::sync::Arc;

// =============================================================================
// OUTCOMES
// =============================================================================

/// Read model of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub position: OrderPosition,
    /// Name of the current (or last) stage, if the order has one.
    pub stage_name: Option<String>,
    pub active_token: Option<TokenId>,
    pub version: u64,
    pub updated_at: u64,
}

/// A freshly issued checkpoint token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedHandoff {
    pub token_id: TokenId,
    pub target_stage: StageIndex,
    pub token: SignedToken,
    /// The JSON form, ready to print.
    pub raw: String,
    /// The base64url form, ready for a QR encoder.
    pub scan_code: String,
    pub expires_at: u64,
    /// The token this one replaced, if any.
    pub superseded: Option<TokenId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandoffOutcome {
    Issued(IssuedHandoff),
    Blocked(GateReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed(OrderSummary),
    /// Active blocks exist for the token's stage. The token stays usable.
    Blocked { stage: StageIndex, blocks: Vec<Block> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReadyOutcome {
    Advanced(OrderSummary),
    ReadyToShip(OrderSummary),
    Blocked(GateReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShipOutcome {
    Shipped(OrderSummary),
    AlreadyShipped(OrderSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Active,
    Consumed,
    Superseded,
    /// Correctly signed, but never issued by this store.
    Unknown,
}

/// Result of checking a token without using it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInspection {
    pub order_id: OrderId,
    pub stage_id: StageIndex,
    pub issued_at: u64,
    pub expires_at: u64,
    pub state: TokenState,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct StageEngine {
    registry: Arc<StageRegistry>,
    gate: MaterialGate,
    signer: TokenSigner,
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageEngine")
            .field("stages", &self.registry.list_active_stages().len())
            .field("gate", &self.gate)
            .field("signer", &self.signer)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn check_notes(field: &'static str, notes: Option<&str>) -> Result<(), EngineError> {
    match notes {
        Some(text) if text.len() > MAX_NOTES_LENGTH => Err(EngineError::invalid(
            field,
            format!("exceeds {MAX_NOTES_LENGTH} bytes"),
        )),
        _ => Ok(()),
    }
}

/// The order row as a successful commit left it.
fn settled(
    mut record: OrderRecord,
    position: OrderPosition,
    version: Option<u64>,
    now: u64,
) -> OrderRecord {
    record.version = version.unwrap_or_else(|| record.version.saturating_add(1));
    record.position = position;
    record.active_token = None;
    record.updated_at = now;
    record
}

/// Deactivation entry for the order's outstanding token, if any.
fn supersede(record: &OrderRecord) -> Vec<(TokenId, Deactivation)> {
    record
        .active_token
        .map(|id| vec![(id, Deactivation::Superseded)])
        .unwrap_or_default()
}

impl StageEngine {
    /// An engine with the system clock, log notifications and the default
    /// retry policy.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        gate: MaterialGate,
        signer: TokenSigner,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            registry,
            gate,
            signer,
            store,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // helpers
    // -------------------------------------------------------------------------

    fn now(&self) -> u64 {
        self.clock.now_epoch_seconds()
    }

    fn load(&self, order: OrderId) -> Result<OrderRecord, EngineError> {
        self.store
            .order(order)?
            .ok_or(EngineError::UnknownOrder(order))
    }

    fn summarize(&self, record: &OrderRecord) -> OrderSummary {
        OrderSummary {
            order_id: record.id,
            position: record.position,
            stage_name: record
                .position
                .last_stage()
                .and_then(|s| self.registry.get_any(s))
                .map(|s| s.name.clone()),
            active_token: record.active_token,
            version: record.version,
            updated_at: record.updated_at,
        }
    }

    fn send(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification) {
            tracing::warn!(
                order_id = %notification.order_id,
                kind = ?notification.kind,
                error = %e,
                "notification failed"
            );
        }
    }

    fn notify(
        &self,
        recipient: Recipient,
        kind: NotificationKind,
        order: OrderId,
        stage: Option<StageIndex>,
        title: String,
        body: String,
    ) {
        self.send(Notification {
            recipient,
            kind,
            order_id: order,
            stage,
            title,
            body,
        });
    }

    fn stage_label(&self, stage: StageIndex) -> String {
        self.registry
            .get_any(stage)
            .map_or_else(|| stage.to_string(), |s| s.name.clone())
    }

    /// Run the gate for `stage` against every block already recorded there.
    fn evaluate(&self, order: OrderId, stage: StageIndex, now: u64) -> Result<GateDecision, EngineError> {
        let existing = self.store.blocks(&BlockFilter {
            order_id: Some(order),
            stage: Some(stage),
            status: None,
        })?;
        Ok(self.gate.evaluate(order, stage, &existing, now))
    }

    /// Commit only the block records of a blocked decision and report.
    fn commit_blocked(&self, order: OrderId, decision: GateDecision) -> Result<GateReport, EngineError> {
        let stage = decision.stage;
        self.store.commit(WriteBatch {
            blocks: decision.writes,
            ..WriteBatch::new()
        })?;
        let blocks = self
            .store
            .blocks(&BlockFilter::active().for_order(order).for_stage(stage))?;
        tracing::info!(
            event = "transition_blocked",
            order_id = %order,
            stage = %stage,
            shortages = decision.shortages.len(),
            "material gate blocked transition"
        );
        Ok(GateReport {
            stage,
            shortages: decision.shortages,
            overridden: decision.overridden,
            blocks,
        })
    }

    fn notify_blocked(&self, order: OrderId, report: &GateReport) {
        let materials: Vec<String> = report
            .shortages
            .iter()
            .map(|s| format!("{} (missing {} {})", s.material_name, s.missing, s.unit))
            .collect();
        self.notify(
            Recipient::Broadcast,
            NotificationKind::Blocked,
            order,
            Some(report.stage),
            format!("Order {order} blocked before {}", self.stage_label(report.stage)),
            materials.join(", "),
        );
    }

    // -------------------------------------------------------------------------
    // registration
    // -------------------------------------------------------------------------

    /// Seed the order row. Registering an existing order returns it unchanged.
    pub fn register_order(
        &self,
        principal: &Principal,
        order: OrderId,
        stage: Option<StageIndex>,
    ) -> Result<OrderSummary, EngineError> {
        principal.require(Capability::GenerateCheckpoint)?;
        if let Some(stage) = stage {
            self.registry.require(stage)?;
        }
        let position = stage.map_or(OrderPosition::Unassigned, |stage| OrderPosition::AtStage { stage });

        self.retry.run("register_order", |_| {
            if let Some(existing) = self.store.order(order)? {
                return Ok(self.summarize(&existing));
            }
            let record = OrderRecord::new(order, position, self.now());
            self.store.commit(WriteBatch {
                order: Some(OrderWrite::Insert(record.clone())),
                ..WriteBatch::new()
            })?;
            tracing::info!(event = "order_registered", order_id = %order, position = %position, "order registered");
            Ok(self.summarize(&record))
        })
    }

    // -------------------------------------------------------------------------
    // request handoff
    // -------------------------------------------------------------------------

    /// Gate the target stage and, when clear, issue a checkpoint token for it.
    ///
    /// The order does not move; it becomes pending transfer to `target`.
    pub fn request_handoff(
        &self,
        principal: &Principal,
        order: OrderId,
        target: StageIndex,
    ) -> Result<HandoffOutcome, EngineError> {
        principal.require(Capability::GenerateCheckpoint)?;
        self.registry.require(target)?;

        let outcome = self.retry.run("request_handoff", |attempt| {
            let now = self.now();
            let record = self.load(order)?;
            match record.position {
                OrderPosition::Unassigned => self.registry.check_forward(None, target)?,
                OrderPosition::AtStage { stage } => self.registry.check_forward(Some(stage), target)?,
                position @ (OrderPosition::ReadyToShip { .. } | OrderPosition::Shipped { .. }) => {
                    return Err(EngineError::InvalidTransition {
                        order,
                        position,
                        action: "request a handoff",
                    });
                }
            }

            let decision = self.evaluate(order, target, now)?;
            if !decision.is_clear() {
                return self.commit_blocked(order, decision).map(HandoffOutcome::Blocked);
            }

            let token = self.signer.sign(order, target, now);
            let raw = token.to_json()?;
            let scan_code = token.to_scan_code()?;
            let expires_at = self.signer.expires_at(now);
            let receipt = self.store.commit(WriteBatch {
                order: Some(OrderWrite::Update {
                    id: order,
                    expected_version: record.version,
                    position: record.position,
                    active_token: TokenSlot::NewToken,
                    at: now,
                }),
                new_token: Some(NewToken {
                    order_id: order,
                    stage_id: target,
                    issued_at: now,
                    expires_at,
                    signature: token.signature.clone(),
                    issued_by: principal.id.clone(),
                }),
                deactivate_tokens: supersede(&record),
                transfers: vec![NewTransfer {
                    order_id: order,
                    from_stage: record.position.current_stage(),
                    to_stage: Some(target),
                    scanned_by: principal.id.clone(),
                    status: TransferStatus::Pending,
                    transfer_type: TransferType::Normal,
                    notes: None,
                    created_at: now,
                }],
                blocks: decision.writes,
            })?;
            let token_id = receipt.token_id.ok_or_else(|| {
                EngineError::Store(StoreError::Corrupt(
                    "commit did not assign a token id".to_string(),
                ))
            })?;

            tracing::info!(
                event = "handoff_issued",
                order_id = %order,
                stage = %target,
                token_id = %token_id,
                attempt,
                "checkpoint token issued"
            );
            Ok(HandoffOutcome::Issued(IssuedHandoff {
                token_id,
                target_stage: target,
                token,
                raw,
                scan_code,
                expires_at,
                superseded: record.active_token,
            }))
        })?;

        match &outcome {
            HandoffOutcome::Issued(issued) => self.notify(
                Recipient::Broadcast,
                NotificationKind::HandoffRequested,
                order,
                Some(target),
                format!("Order {order} ready for {}", self.stage_label(target)),
                format!("Checkpoint token {} issued by {}", issued.token_id, principal.id),
            ),
            HandoffOutcome::Blocked(report) => self.notify_blocked(order, report),
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // confirm handoff
    // -------------------------------------------------------------------------

    /// Verify a scanned token and move the order to the token's stage.
    pub fn confirm_handoff(
        &self,
        principal: &Principal,
        raw_token: &str,
    ) -> Result<ConfirmOutcome, EngineError> {
        principal.require(Capability::Confirm)?;
        let verified = self.signer.verify(raw_token, self.now()).inspect_err(|e| {
            tracing::warn!(
                event = "token_rejected",
                reason = e.reason_code(),
                scanned_by = %principal.id,
                "checkpoint token rejected"
            );
        })?;
        principal.require_stage(verified.stage_id)?;
        self.registry.require(verified.stage_id)?;

        let order = verified.order_id;
        let stage = verified.stage_id;
        let (outcome, issued_by) = self.retry.run("confirm_handoff", |attempt| {
            let now = self.now();
            let token = self
                .store
                .token_by_signature(&verified.signature)?
                .filter(|t| t.order_id == order && t.stage_id == stage)
                .ok_or(TokenError::Unknown)?;
            if !token.is_active {
                return Err(token.inactive_error().into());
            }
            let record = self.load(order)?;
            if record.active_token != Some(token.id) {
                return Err(TokenError::Superseded.into());
            }
            if matches!(
                record.position,
                OrderPosition::ReadyToShip { .. } | OrderPosition::Shipped { .. }
            ) {
                return Err(EngineError::InvalidTransition {
                    order,
                    position: record.position,
                    action: "confirm a handoff",
                });
            }

            let blocks = self
                .store
                .blocks(&BlockFilter::active().for_order(order).for_stage(stage))?;
            if !blocks.is_empty() {
                tracing::info!(
                    event = "confirm_blocked",
                    order_id = %order,
                    stage = %stage,
                    blocks = blocks.len(),
                    "active blocks prevent confirmation"
                );
                return Ok((ConfirmOutcome::Blocked { stage, blocks }, token.issued_by));
            }

            let receipt = self.store.commit(WriteBatch {
                order: Some(OrderWrite::Update {
                    id: order,
                    expected_version: record.version,
                    position: OrderPosition::AtStage { stage },
                    active_token: TokenSlot::Clear,
                    at: now,
                }),
                deactivate_tokens: vec![(token.id, Deactivation::Consumed)],
                transfers: vec![NewTransfer {
                    order_id: order,
                    from_stage: record.position.current_stage(),
                    to_stage: Some(stage),
                    scanned_by: principal.id.clone(),
                    status: TransferStatus::Confirmed,
                    transfer_type: TransferType::Normal,
                    notes: None,
                    created_at: now,
                }],
                ..WriteBatch::new()
            })?;

            tracing::info!(
                event = "handoff_confirmed",
                order_id = %order,
                stage = %stage,
                token_id = %token.id,
                scanned_by = %principal.id,
                attempt,
                "order moved to stage"
            );
            let moved = settled(record, OrderPosition::AtStage { stage }, receipt.order_version, now);
            Ok((ConfirmOutcome::Confirmed(self.summarize(&moved)), token.issued_by))
        })?;

        if let ConfirmOutcome::Confirmed(_) = &outcome {
            self.notify(
                Recipient::User(issued_by),
                NotificationKind::HandoffConfirmed,
                order,
                Some(stage),
                format!("Order {order} arrived at {}", self.stage_label(stage)),
                format!("Scanned by {}", principal.id),
            );
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // mark ready
    // -------------------------------------------------------------------------

    /// Finish work at the current stage and advance without a scan.
    ///
    /// On the last stage the order becomes `ReadyToShip`.
    pub fn mark_ready(
        &self,
        principal: &Principal,
        order: OrderId,
        notes: Option<String>,
    ) -> Result<ReadyOutcome, EngineError> {
        principal.require(Capability::Confirm)?;
        check_notes("notes", notes.as_deref())?;

        let outcome = self.retry.run("mark_ready", |attempt| {
            let now = self.now();
            let record = self.load(order)?;
            let OrderPosition::AtStage { stage: current } = record.position else {
                return Err(EngineError::InvalidTransition {
                    order,
                    position: record.position,
                    action: "be marked ready",
                });
            };
            principal.require_stage(current)?;

            let (position, to_stage, writes) = match self.registry.next_stage(current)? {
                NextStage::Terminal => (
                    OrderPosition::ReadyToShip { last_stage: current },
                    current,
                    Vec::new(),
                ),
                NextStage::Stage(next) => {
                    let decision = self.evaluate(order, next.index, now)?;
                    if !decision.is_clear() {
                        return self.commit_blocked(order, decision).map(ReadyOutcome::Blocked);
                    }
                    (OrderPosition::AtStage { stage: next.index }, next.index, decision.writes)
                }
            };

            let receipt = self.store.commit(WriteBatch {
                order: Some(OrderWrite::Update {
                    id: order,
                    expected_version: record.version,
                    position,
                    active_token: TokenSlot::Clear,
                    at: now,
                }),
                deactivate_tokens: supersede(&record),
                transfers: vec![NewTransfer {
                    order_id: order,
                    from_stage: Some(current),
                    to_stage: Some(to_stage),
                    scanned_by: principal.id.clone(),
                    status: TransferStatus::Ready,
                    transfer_type: TransferType::Normal,
                    notes: notes.clone(),
                    created_at: now,
                }],
                blocks: writes,
                ..WriteBatch::new()
            })?;

            tracing::info!(
                event = "order_ready",
                order_id = %order,
                from = %current,
                position = %position,
                attempt,
                "stage work marked ready"
            );
            let moved = settled(record, position, receipt.order_version, now);
            let summary = self.summarize(&moved);
            Ok(match position {
                OrderPosition::ReadyToShip { .. } => ReadyOutcome::ReadyToShip(summary),
                _ => ReadyOutcome::Advanced(summary),
            })
        })?;

        match &outcome {
            ReadyOutcome::Advanced(summary) | ReadyOutcome::ReadyToShip(summary) => self.notify(
                Recipient::Broadcast,
                NotificationKind::Ready,
                order,
                summary.position.last_stage(),
                format!("Order {order} is {}", summary.position),
                notes.unwrap_or_default(),
            ),
            ReadyOutcome::Blocked(report) => self.notify_blocked(order, report),
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // return for rework
    // -------------------------------------------------------------------------

    /// Send an order back to an earlier stage. Bypasses the material gate.
    pub fn return_for_rework(
        &self,
        principal: &Principal,
        order: OrderId,
        from: StageIndex,
        to: StageIndex,
        reason: &str,
    ) -> Result<OrderSummary, EngineError> {
        principal.require(Capability::ReturnOrders)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::invalid("reason", "must not be empty"));
        }
        check_notes("reason", Some(reason))?;
        self.registry.require(from)?;
        self.registry.require(to)?;
        if to >= from {
            return Err(EngineError::invalid(
                "to_stage",
                format!("stage {to} is not before stage {from}"),
            ));
        }

        let summary = self.retry.run("return_for_rework", |attempt| {
            let now = self.now();
            let record = self.load(order)?;
            let actual = match record.position {
                OrderPosition::AtStage { stage } | OrderPosition::ReadyToShip { last_stage: stage } => {
                    stage
                }
                position @ (OrderPosition::Unassigned | OrderPosition::Shipped { .. }) => {
                    return Err(EngineError::InvalidTransition {
                        order,
                        position,
                        action: "be returned for rework",
                    });
                }
            };
            if actual != from {
                return Err(EngineError::StageMismatch {
                    order,
                    claimed: from,
                    actual: Some(actual),
                });
            }

            let position = OrderPosition::AtStage { stage: to };
            let receipt = self.store.commit(WriteBatch {
                order: Some(OrderWrite::Update {
                    id: order,
                    expected_version: record.version,
                    position,
                    active_token: TokenSlot::Clear,
                    at: now,
                }),
                deactivate_tokens: supersede(&record),
                transfers: vec![NewTransfer {
                    order_id: order,
                    from_stage: Some(from),
                    to_stage: Some(to),
                    scanned_by: principal.id.clone(),
                    status: TransferStatus::Rework,
                    transfer_type: TransferType::Rework,
                    notes: Some(reason.to_string()),
                    created_at: now,
                }],
                ..WriteBatch::new()
            })?;

            tracing::info!(
                event = "order_rework",
                order_id = %order,
                from = %from,
                to = %to,
                attempt,
                "order returned for rework"
            );
            let moved = settled(record, position, receipt.order_version, now);
            Ok(self.summarize(&moved))
        })?;

        self.notify(
            Recipient::Broadcast,
            NotificationKind::Rework,
            order,
            Some(to),
            format!(
                "Order {order} returned from {} to {}",
                self.stage_label(from),
                self.stage_label(to)
            ),
            reason.to_string(),
        );
        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // ship
    // -------------------------------------------------------------------------

    /// Ship a `ReadyToShip` order. Shipping twice is a no-op.
    pub fn ship(&self, principal: &Principal, order: OrderId) -> Result<ShipOutcome, EngineError> {
        principal.require(Capability::Confirm)?;

        let outcome = self.retry.run("ship", |attempt| {
            let now = self.now();
            let record = self.load(order)?;
            let last_stage = match record.position {
                OrderPosition::Shipped { .. } => {
                    return Ok(ShipOutcome::AlreadyShipped(self.summarize(&record)));
                }
                OrderPosition::ReadyToShip { last_stage } => last_stage,
                position @ (OrderPosition::Unassigned | OrderPosition::AtStage { .. }) => {
                    return Err(EngineError::InvalidTransition {
                        order,
                        position,
                        action: "ship",
                    });
                }
            };

            let position = OrderPosition::Shipped { last_stage };
            let receipt = self.store.commit(WriteBatch {
                order: Some(OrderWrite::Update {
                    id: order,
                    expected_version: record.version,
                    position,
                    active_token: TokenSlot::Clear,
                    at: now,
                }),
                deactivate_tokens: supersede(&record),
                transfers: vec![NewTransfer {
                    order_id: order,
                    from_stage: Some(last_stage),
                    to_stage: None,
                    scanned_by: principal.id.clone(),
                    status: TransferStatus::Shipped,
                    transfer_type: TransferType::Normal,
                    notes: None,
                    created_at: now,
                }],
                ..WriteBatch::new()
            })?;

            tracing::info!(event = "order_shipped", order_id = %order, attempt, "order shipped");
            let moved = settled(record, position, receipt.order_version, now);
            Ok(ShipOutcome::Shipped(self.summarize(&moved)))
        })?;

        if let ShipOutcome::Shipped(_) = &outcome {
            self.notify(
                Recipient::Broadcast,
                NotificationKind::Shipped,
                order,
                None,
                format!("Order {order} shipped"),
                String::new(),
            );
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // blocks
    // -------------------------------------------------------------------------

    pub fn list_blocks(&self, filter: &BlockFilter) -> Result<Vec<Block>, EngineError> {
        Ok(self.store.blocks(filter)?)
    }

    /// Active blocks, optionally narrowed to one order and stage.
    pub fn list_active_blocks(
        &self,
        order: Option<OrderId>,
        stage: Option<StageIndex>,
    ) -> Result<Vec<Block>, EngineError> {
        self.list_blocks(&BlockFilter {
            order_id: order,
            stage,
            status: Some(BlockStatus::Active),
        })
    }

    /// Mark a block resolved: the shortage was dealt with.
    pub fn resolve_block(
        &self,
        principal: &Principal,
        id: BlockId,
        notes: Option<String>,
    ) -> Result<Block, EngineError> {
        self.close_block(principal, id, BlockStatus::Resolved, notes)
    }

    /// Mark a block ignored: proceed despite the shortage.
    ///
    /// Later gate runs for the same order, stage and material treat the
    /// material as overridden.
    pub fn ignore_block(
        &self,
        principal: &Principal,
        id: BlockId,
        notes: Option<String>,
    ) -> Result<Block, EngineError> {
        self.close_block(principal, id, BlockStatus::Ignored, notes)
    }

    fn close_block(
        &self,
        principal: &Principal,
        id: BlockId,
        status: BlockStatus,
        notes: Option<String>,
    ) -> Result<Block, EngineError> {
        principal.require(Capability::GenerateCheckpoint)?;
        check_notes("notes", notes.as_deref())?;

        self.retry.run("close_block", |_| {
            let now = self.now();
            let mut block = self.store.block(id)?.ok_or(EngineError::UnknownBlock(id))?;
            if !block.is_active() {
                return Err(EngineError::BlockNotActive(id));
            }
            self.store.commit(WriteBatch {
                blocks: vec![BlockWrite::SetStatus {
                    id,
                    status,
                    at: now,
                    notes: notes.clone(),
                }],
                ..WriteBatch::new()
            })?;
            tracing::info!(
                event = "block_closed",
                block_id = %id,
                order_id = %block.order_id,
                status = ?status,
                by = %principal.id,
                "block closed"
            );
            block.close(status, now, notes.clone());
            Ok(block)
        })
    }

    // -------------------------------------------------------------------------
    // queries
    // -------------------------------------------------------------------------

    pub fn order_summary(&self, order: OrderId) -> Result<OrderSummary, EngineError> {
        Ok(self.summarize(&self.load(order)?))
    }

    /// The audit trail of one order, oldest first.
    pub fn transfers(&self, order: OrderId) -> Result<Vec<Transfer>, EngineError> {
        self.load(order)?;
        Ok(self.store.transfers(order)?)
    }

    /// Check a token's signature, age and lifecycle state without using it.
    pub fn inspect_token(&self, raw_token: &str) -> Result<TokenInspection, EngineError> {
        let verified = self.signer.verify(raw_token, self.now())?;
        let record = self
            .store
            .token_by_signature(&verified.signature)?
            .filter(|t| t.order_id == verified.order_id && t.stage_id == verified.stage_id);
        let state = match &record {
            None => TokenState::Unknown,
            Some(t) if t.is_active => TokenState::Active,
            Some(t) => match t.deactivation {
                Some(Deactivation::Superseded) => TokenState::Superseded,
                Some(Deactivation::Consumed) | None => TokenState::Consumed,
            },
        };
        Ok(TokenInspection {
            order_id: verified.order_id,
            stage_id: verified.stage_id,
            issued_at: verified.issued_at,
            expires_at: self.signer.expires_at(verified.issued_at),
            state,
        })
    }
}
