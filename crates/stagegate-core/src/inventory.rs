//! In-memory stock table.
//!
//! Backs the [`Inventory`] collaborator with a catalog of stock levels and
//! per-order material breakdowns. Every lookup goes through a
//! [`MaterialNameResolver`] first, so requirement rows written as
//! "foam 35" still find the "Foam-35" stock line.

use crate::gate::{Inventory, InventoryError};
use crate::normalize::{AliasResolver, MaterialMatch, MaterialNameResolver};
use crate::types::{OrderId, Quantity};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct StockState {
    stock: BTreeMap<String, Quantity>,
    demand: BTreeMap<(OrderId, String), Quantity>,
}

impl StockState {
    fn catalog(&self) -> BTreeSet<String> {
        self.stock.keys().cloned().collect()
    }
}

pub struct StockTable {
    resolver: Arc<dyn MaterialNameResolver>,
    state: RwLock<StockState>,
}

impl std::fmt::Debug for StockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockTable").finish_non_exhaustive()
    }
}

impl Default for StockTable {
    fn default() -> Self {
        Self::new(Arc::new(AliasResolver::new()))
    }
}

impl StockTable {
    #[must_use]
    pub fn new(resolver: Arc<dyn MaterialNameResolver>) -> Self {
        Self {
            resolver,
            state: RwLock::new(StockState::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StockState>, InventoryError> {
        self.state
            .read()
            .map_err(|_| InventoryError::Unavailable("stock table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StockState>, InventoryError> {
        self.state
            .write()
            .map_err(|_| InventoryError::Unavailable("stock table lock poisoned".to_string()))
    }

    /// Set the stock level of a catalog material, adding it if new.
    pub fn set_stock(&self, material: &str, quantity: Quantity) -> Result<(), InventoryError> {
        let material = material.trim();
        if quantity.is_negative() {
            return Err(InventoryError::NegativeQuantity(material.to_string()));
        }
        self.write()?.stock.insert(material.to_string(), quantity);
        Ok(())
    }

    /// Replace one order's material breakdown.
    ///
    /// Every name must resolve to a catalog material; nothing changes if
    /// one does not. Lines naming the same material add up. An empty
    /// breakdown clears the order, so the gate falls back to the stage
    /// requirement quantities.
    pub fn replace_order_demand<S: AsRef<str>>(
        &self,
        order: OrderId,
        lines: &[(S, Quantity)],
    ) -> Result<BTreeMap<String, Quantity>, InventoryError> {
        let mut breakdown: BTreeMap<String, Quantity> = BTreeMap::new();
        for (material, quantity) in lines {
            let material = material.as_ref();
            if quantity.is_negative() {
                return Err(InventoryError::NegativeQuantity(material.trim().to_string()));
            }
            let total = breakdown.entry(self.canonical(material)?).or_default();
            *total = total.saturating_add(*quantity);
        }

        let mut state = self.write()?;
        state.demand.retain(|(o, _), _| *o != order);
        state.demand.extend(
            breakdown
                .iter()
                .map(|(material, quantity)| ((order, material.clone()), *quantity)),
        );
        Ok(breakdown)
    }

    /// Resolve a name against the current catalog.
    pub fn lookup(&self, material: &str) -> Result<MaterialMatch, InventoryError> {
        let catalog = self.read()?.catalog();
        Ok(self.resolver.resolve(material, &catalog))
    }

    fn canonical(&self, material: &str) -> Result<String, InventoryError> {
        match self.lookup(material)? {
            MaterialMatch::Unmatched { input } => Err(InventoryError::UnknownMaterial(input)),
            matched => {
                if !matches!(matched, MaterialMatch::Exact { .. }) {
                    tracing::debug!(material, resolved = ?matched, "material name normalized");
                }
                Ok(matched.canonical().unwrap_or(material).to_string())
            }
        }
    }

    /// Snapshot of every stock line.
    pub fn snapshot(&self) -> Result<Vec<(String, Quantity)>, InventoryError> {
        Ok(self
            .read()?
            .stock
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}

impl Inventory for StockTable {
    fn available_quantity(&self, material: &str) -> Result<Quantity, InventoryError> {
        let canonical = self.canonical(material)?;
        self.read()?
            .stock
            .get(&canonical)
            .copied()
            .ok_or(InventoryError::UnknownMaterial(canonical))
    }

    fn required_quantity(
        &self,
        order: OrderId,
        material: &str,
    ) -> Result<Option<Quantity>, InventoryError> {
        let canonical = self.canonical(material)?;
        Ok(self.read()?.demand.get(&(order, canonical)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StockTable {
        let table = StockTable::new(Arc::new(AliasResolver::with_aliases([(
            "Schaum 35",
            "Foam-35",
        )])));
        table
            .set_stock("Foam-35", Quantity::from_units(6))
            .expect("stock");
        table
    }

    #[test]
    fn lookups_go_through_the_resolver() {
        let t = table();
        assert_eq!(
            t.available_quantity("foam 35").expect("fuzzy"),
            Quantity::from_units(6)
        );
        assert_eq!(
            t.available_quantity("schaum35").expect("alias"),
            Quantity::from_units(6)
        );
    }

    #[test]
    fn unmatched_material_is_an_error() {
        assert!(matches!(
            table().available_quantity("Velvet"),
            Err(InventoryError::UnknownMaterial(_))
        ));
    }

    #[test]
    fn order_demand_is_per_order() {
        let t = table();
        let breakdown = t
            .replace_order_demand(
                OrderId(1),
                &[("FOAM-35", Quantity::from_units(2)), ("foam 35", Quantity::from_units(1))],
            )
            .expect("demand");
        assert_eq!(breakdown.get("Foam-35"), Some(&Quantity::from_units(3)));
        assert_eq!(
            t.required_quantity(OrderId(1), "Foam-35").expect("read"),
            Some(Quantity::from_units(3))
        );
        assert_eq!(t.required_quantity(OrderId(2), "Foam-35").expect("read"), None);

        t.replace_order_demand::<&str>(OrderId(1), &[]).expect("clear");
        assert_eq!(t.required_quantity(OrderId(1), "Foam-35").expect("read"), None);
    }

    #[test]
    fn bad_breakdown_changes_nothing() {
        let t = table();
        t.replace_order_demand(OrderId(1), &[("Foam-35", Quantity::from_units(2))])
            .expect("demand");
        assert!(matches!(
            t.replace_order_demand(
                OrderId(1),
                &[("Foam-35", Quantity::from_units(1)), ("Velvet", Quantity::from_units(1))],
            ),
            Err(InventoryError::UnknownMaterial(_))
        ));
        assert!(matches!(
            t.replace_order_demand(OrderId(1), &[("Foam-35", Quantity::from_units(-1))]),
            Err(InventoryError::NegativeQuantity(_))
        ));
        assert_eq!(
            t.required_quantity(OrderId(1), "Foam-35").expect("read"),
            Some(Quantity::from_units(2))
        );
    }

    #[test]
    fn negative_stock_rejected() {
        let t = table();
        assert_eq!(
            t.set_stock("Plywood", Quantity::from_units(-3)),
            Err(InventoryError::NegativeQuantity("Plywood".to_string()))
        );
        assert!(matches!(
            t.available_quantity("Plywood"),
            Err(InventoryError::UnknownMaterial(_))
        ));
    }

    #[test]
    fn alias_to_missing_stock_line_is_unknown() {
        let t = StockTable::new(Arc::new(AliasResolver::with_aliases([("ply", "Plywood")])));
        t.set_stock("Foam-35", Quantity::from_units(6)).expect("stock");
        assert_eq!(
            t.available_quantity("ply"),
            Err(InventoryError::UnknownMaterial("ply".to_string()))
        );
    }
}
