//! # Material Availability Gate
//!
//! Decides whether an order may enter a stage, given the stage's material
//! requirements, the order's own demand and the current stock.
//!
//! The gate never writes anything itself. It returns a [`GateDecision`]
//! whose block writes the engine commits, either alone (blocked) or in the
//! same batch as the transition (clear).
//!
//! ## Rules
//!
//! - Only requirements with `is_required` are checked. A material with no
//!   requirement row is not applicable to the stage.
//! - `shortage = max(0, demanded - available)`; the stage is clear iff no
//!   shortage is positive.
//! - A material with an `Ignored` block for the same order and stage is
//!   overridden and never blocks again.
//! - An inventory failure counts as a full shortage (available 0).
//! - Active blocks whose material is no longer short are resolved.

use crate::ledger::{Block, BlockStatus};
use crate::storage::BlockWrite;
use crate::types::{OrderId, Quantity, StageIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

/// Note recorded on blocks closed by re-evaluation.
pub const AUTO_RESOLVE_NOTE: &str = "stock sufficient on re-evaluation";

// =============================================================================
// REQUIREMENTS
// =============================================================================

/// Static material requirement of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRequirement {
    #[serde(rename = "stage")]
    pub stage_index: StageIndex,
    #[serde(rename = "material")]
    pub material_name: String,
    #[serde(rename = "quantity")]
    pub required_quantity: Quantity,
    pub unit: String,
    #[serde(default = "default_required")]
    pub is_required: bool,
}

fn default_required() -> bool {
    true
}

/// Requirements grouped by stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementBook {
    by_stage: BTreeMap<StageIndex, Vec<MaterialRequirement>>,
}

impl RequirementBook {
    #[must_use]
    pub fn new(requirements: Vec<MaterialRequirement>) -> Self {
        let mut by_stage: BTreeMap<StageIndex, Vec<MaterialRequirement>> = BTreeMap::new();
        for req in requirements {
            by_stage.entry(req.stage_index).or_default().push(req);
        }
        Self { by_stage }
    }

    /// Requirements of `stage` that the gate checks.
    pub fn required_for(&self, stage: StageIndex) -> impl Iterator<Item = &MaterialRequirement> {
        self.by_stage
            .get(&stage)
            .into_iter()
            .flatten()
            .filter(|r| r.is_required)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_stage.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_stage.is_empty()
    }
}

// =============================================================================
// INVENTORY COLLABORATOR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("Inventory unavailable: {0}")]
    Unavailable(String),

    #[error("Material '{0}' is not in the inventory catalog")]
    UnknownMaterial(String),

    #[error("Quantity of '{0}' must not be negative")]
    NegativeQuantity(String),
}

/// Read-only view of stock and per-order demand.
pub trait Inventory: Send + Sync {
    /// Units of `material` currently in stock.
    fn available_quantity(&self, material: &str) -> Result<Quantity, InventoryError>;

    /// The order's own demand for `material`, if its breakdown lists it.
    ///
    /// `None` falls back to the stage requirement quantity.
    fn required_quantity(
        &self,
        order: OrderId,
        material: &str,
    ) -> Result<Option<Quantity>, InventoryError>;
}

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortageReason {
    /// Stock is below demand.
    Insufficient,
    /// Stock could not be determined.
    InventoryUnavailable,
}

/// One material that cannot be covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub material_name: String,
    pub unit: String,
    pub required: Quantity,
    pub available: Quantity,
    pub missing: Quantity,
    pub reason: ShortageReason,
}

/// What the gate found, plus the block writes that record it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub stage: StageIndex,
    pub shortages: Vec<Shortage>,
    /// Materials short on stock but waved through by an ignored block.
    pub overridden: Vec<String>,
    pub writes: Vec<BlockWrite>,
}

impl GateDecision {
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.shortages.is_empty()
    }
}

/// The structured "blocked" outcome handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub stage: StageIndex,
    pub shortages: Vec<Shortage>,
    pub overridden: Vec<String>,
    /// Active blocks for the order and stage after the commit.
    pub blocks: Vec<Block>,
}

// =============================================================================
// GATE
// =============================================================================

#[derive(Clone)]
pub struct MaterialGate {
    requirements: Arc<RequirementBook>,
    inventory: Arc<dyn Inventory>,
}

impl std::fmt::Debug for MaterialGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialGate")
            .field("requirements", &self.requirements.len())
            .finish_non_exhaustive()
    }
}

impl MaterialGate {
    #[must_use]
    pub fn new(requirements: RequirementBook, inventory: Arc<dyn Inventory>) -> Self {
        Self {
            requirements: Arc::new(requirements),
            inventory,
        }
    }

    #[must_use]
    pub fn requirements(&self) -> &RequirementBook {
        &self.requirements
    }

    /// Compute the shortage of one requirement for `order`.
    fn shortage_of(&self, order: OrderId, req: &MaterialRequirement) -> Option<Shortage> {
        let name = req.material_name.as_str();
        let lookup = self.inventory.required_quantity(order, name).and_then(|demand| {
            let required = demand.unwrap_or(req.required_quantity);
            self.inventory
                .available_quantity(name)
                .map(|available| (required, available))
        });
        let (required, available, reason) = match lookup {
            Ok((required, available)) => (required, available, ShortageReason::Insufficient),
            Err(e) => {
                tracing::warn!(
                    order_id = %order,
                    stage = %req.stage_index,
                    material = name,
                    error = %e,
                    "inventory lookup failed, treating material as unavailable"
                );
                (req.required_quantity, Quantity::ZERO, ShortageReason::InventoryUnavailable)
            }
        };
        let missing = required.shortage_against(available);
        missing.is_positive().then(|| Shortage {
            material_name: req.material_name.clone(),
            unit: req.unit.clone(),
            required,
            available,
            missing,
            reason,
        })
    }

    /// Evaluate `stage` for `order`.
    ///
    /// `existing` must hold every block recorded for this order and stage,
    /// whatever its status.
    #[must_use]
    pub fn evaluate(
        &self,
        order: OrderId,
        stage: StageIndex,
        existing: &[Block],
        now: u64,
    ) -> GateDecision {
        let ignored: BTreeSet<&str> = existing
            .iter()
            .filter(|b| b.status == BlockStatus::Ignored)
            .map(|b| b.material_name.as_str())
            .collect();

        let mut shortages = Vec::new();
        let mut overridden = Vec::new();
        for req in self.requirements.required_for(stage) {
            let Some(shortage) = self.shortage_of(order, req) else {
                continue;
            };
            if ignored.contains(req.material_name.as_str()) {
                overridden.push(shortage.material_name);
            } else {
                shortages.push(shortage);
            }
        }

        let short: BTreeSet<&str> = shortages.iter().map(|s| s.material_name.as_str()).collect();
        let mut writes: Vec<BlockWrite> = existing
            .iter()
            .filter(|b| b.is_active() && !short.contains(b.material_name.as_str()))
            .map(|b| BlockWrite::SetStatus {
                id: b.id,
                status: BlockStatus::Resolved,
                at: now,
                notes: Some(AUTO_RESOLVE_NOTE.to_string()),
            })
            .collect();
        writes.extend(shortages.iter().map(|s| BlockWrite::Raise {
            order,
            stage,
            shortage: s.clone(),
            at: now,
        }));

        tracing::debug!(
            order_id = %order,
            stage = %stage,
            shortages = shortages.len(),
            overridden = overridden.len(),
            "material gate evaluated"
        );

        GateDecision {
            stage,
            shortages,
            overridden,
            writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockId;
    use std::collections::HashMap;

    struct FixedStock {
        stock: HashMap<&'static str, i64>,
        demand: HashMap<&'static str, i64>,
        broken: bool,
    }

    impl Inventory for FixedStock {
        fn available_quantity(&self, material: &str) -> Result<Quantity, InventoryError> {
            if self.broken {
                return Err(InventoryError::Unavailable("offline".into()));
            }
            Ok(Quantity::from_units(
                self.stock.get(material).copied().unwrap_or(0),
            ))
        }

        fn required_quantity(
            &self,
            _order: OrderId,
            material: &str,
        ) -> Result<Option<Quantity>, InventoryError> {
            Ok(self.demand.get(material).map(|q| Quantity::from_units(*q)))
        }
    }

    fn requirement(stage: u32, name: &str, qty: i64) -> MaterialRequirement {
        MaterialRequirement {
            stage_index: StageIndex(stage),
            material_name: name.into(),
            required_quantity: Quantity::from_units(qty),
            unit: "sheet".into(),
            is_required: true,
        }
    }

    fn gate(stock: i64, broken: bool) -> MaterialGate {
        let mut optional = requirement(2, "Glue", 99);
        optional.is_required = false;
        MaterialGate::new(
            RequirementBook::new(vec![requirement(2, "Foam-35", 10), optional]),
            Arc::new(FixedStock {
                stock: HashMap::from([("Foam-35", stock)]),
                demand: HashMap::new(),
                broken,
            }),
        )
    }

    #[test]
    fn shortage_is_required_minus_available() {
        let decision = gate(6, false).evaluate(OrderId(1), StageIndex(2), &[], 10);
        assert!(!decision.is_clear());
        assert_eq!(decision.shortages.len(), 1);
        assert_eq!(decision.shortages[0].missing, Quantity::from_units(4));
        assert!(matches!(decision.writes[0], BlockWrite::Raise { .. }));
    }

    #[test]
    fn sufficient_stock_is_clear_without_writes() {
        let decision = gate(10, false).evaluate(OrderId(1), StageIndex(2), &[], 10);
        assert!(decision.is_clear());
        assert!(decision.writes.is_empty());
    }

    #[test]
    fn stage_without_requirements_is_clear() {
        let decision = gate(0, false).evaluate(OrderId(1), StageIndex(4), &[], 10);
        assert!(decision.is_clear());
    }

    #[test]
    fn order_demand_overrides_requirement_quantity() {
        let g = MaterialGate::new(
            RequirementBook::new(vec![requirement(2, "Foam-35", 10)]),
            Arc::new(FixedStock {
                stock: HashMap::from([("Foam-35", 6)]),
                demand: HashMap::from([("Foam-35", 5)]),
                broken: false,
            }),
        );
        assert!(g.evaluate(OrderId(1), StageIndex(2), &[], 10).is_clear());
    }

    #[test]
    fn inventory_failure_blocks_conservatively() {
        let decision = gate(100, true).evaluate(OrderId(1), StageIndex(2), &[], 10);
        assert_eq!(decision.shortages.len(), 1);
        assert_eq!(
            decision.shortages[0].reason,
            ShortageReason::InventoryUnavailable
        );
        assert_eq!(decision.shortages[0].missing, Quantity::from_units(10));
    }

    #[test]
    fn recovered_stock_resolves_active_block() {
        let g = gate(6, false);
        let short = g.evaluate(OrderId(1), StageIndex(2), &[], 10);
        let block = Block::raised(BlockId(3), OrderId(1), StageIndex(2), &short.shortages[0], 10);

        let recovered = gate(10, false).evaluate(OrderId(1), StageIndex(2), &[block], 20);
        assert!(recovered.is_clear());
        assert_eq!(
            recovered.writes,
            vec![BlockWrite::SetStatus {
                id: BlockId(3),
                status: BlockStatus::Resolved,
                at: 20,
                notes: Some(AUTO_RESOLVE_NOTE.to_string()),
            }]
        );
    }

    #[test]
    fn ignored_block_overrides_shortage() {
        let g = gate(6, false);
        let short = g.evaluate(OrderId(1), StageIndex(2), &[], 10);
        let mut block =
            Block::raised(BlockId(3), OrderId(1), StageIndex(2), &short.shortages[0], 10);
        block.close(BlockStatus::Ignored, 11, Some("use offcuts".into()));

        let decision = g.evaluate(OrderId(1), StageIndex(2), &[block], 20);
        assert!(decision.is_clear());
        assert_eq!(decision.overridden, vec!["Foam-35".to_string()]);
        assert!(decision.writes.is_empty());
    }
}
