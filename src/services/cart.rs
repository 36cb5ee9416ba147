use std::collections::BTreeSet;
use std::sync::RwLock;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument};
use uuid::Uuid;

/// A product as picked on a listing screen, with any extras the user
/// selected for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSelection {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    #[serde(default)]
    pub selected_extra_ids: BTreeSet<Uuid>,
}

/// One line of the in-progress order.
///
/// Invariants: `quantity >= 1`, `unit_price >= 0`. Lines live only in
/// memory; the cart is rebuilt empty on every app start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub selected_extra_ids: BTreeSet<Uuid>,
}

impl CartLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Immutable view of the cart published to observers after every mutation.
#[derive(Debug, Clone, Default)]
pub struct CartSnapshot {
    pub lines: Vec<CartLine>,
    pub total_items: u32,
    pub total_price: Decimal,
}

/// In-memory shopping cart for the current session.
///
/// Screens hold an `Arc<CartStore>` handed down from app wiring (no ambient
/// global) and observe changes through [`CartStore::subscribe`]; the watch
/// channel delivers a fresh [`CartSnapshot`] synchronously with each
/// mutation.
///
/// All operations are total: there are no error paths, only clamping.
#[derive(Debug)]
pub struct CartStore {
    lines: RwLock<Vec<CartLine>>,
    snapshot_tx: watch::Sender<CartSnapshot>,
}

impl Default for CartStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CartStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(CartSnapshot::default());
        Self {
            lines: RwLock::new(Vec::new()),
            snapshot_tx,
        }
    }

    /// Observe the cart. The receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CartSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Adds `quantity` of the selected product, merging into an existing
    /// line matched by product id. A merged add keeps the extras chosen when
    /// the line was first created. Quantity is clamped to at least 1.
    #[instrument(skip(self, selection), fields(product_id = %selection.product_id))]
    pub fn add(&self, selection: ProductSelection, quantity: u32) {
        let quantity = quantity.max(1);
        let mut lines = self.lines.write().expect("cart lock poisoned");

        if let Some(line) = lines
            .iter_mut()
            .find(|line| line.product_id == selection.product_id)
        {
            line.quantity += quantity;
        } else {
            lines.push(CartLine {
                product_id: selection.product_id,
                name: selection.name,
                unit_price: selection.unit_price,
                quantity,
                selected_extra_ids: selection.selected_extra_ids,
            });
        }

        let snapshot = Self::snapshot_of(&lines);
        drop(lines);
        self.publish(snapshot);
    }

    /// Removes the line for `product_id`; absent ids are a no-op.
    pub fn remove(&self, product_id: Uuid) {
        let mut lines = self.lines.write().expect("cart lock poisoned");
        lines.retain(|line| line.product_id != product_id);
        let snapshot = Self::snapshot_of(&lines);
        drop(lines);
        self.publish(snapshot);
    }

    /// Sets the quantity for `product_id`, clamped to at least 1. A line is
    /// never removed this way; use [`CartStore::remove`].
    pub fn update_quantity(&self, product_id: Uuid, quantity: u32) {
        let quantity = quantity.max(1);
        let mut lines = self.lines.write().expect("cart lock poisoned");
        if let Some(line) = lines.iter_mut().find(|line| line.product_id == product_id) {
            line.quantity = quantity;
        }
        let snapshot = Self::snapshot_of(&lines);
        drop(lines);
        self.publish(snapshot);
    }

    /// Empties the cart.
    #[instrument(skip(self))]
    pub fn clear(&self) {
        let mut lines = self.lines.write().expect("cart lock poisoned");
        lines.clear();
        let snapshot = Self::snapshot_of(&lines);
        drop(lines);
        info!("cart cleared");
        self.publish(snapshot);
    }

    /// Sum of quantities across all lines.
    pub fn total_items(&self) -> u32 {
        self.lines
            .read()
            .expect("cart lock poisoned")
            .iter()
            .map(|line| line.quantity)
            .sum()
    }

    /// Pre-tax total: Σ(unit_price × quantity).
    pub fn total_price(&self) -> Decimal {
        self.lines
            .read()
            .expect("cart lock poisoned")
            .iter()
            .map(CartLine::line_total)
            .sum()
    }

    pub fn lines(&self) -> Vec<CartLine> {
        self.lines.read().expect("cart lock poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.read().expect("cart lock poisoned").is_empty()
    }

    fn snapshot_of(lines: &[CartLine]) -> CartSnapshot {
        CartSnapshot {
            lines: lines.to_vec(),
            total_items: lines.iter().map(|line| line.quantity).sum(),
            total_price: lines.iter().map(CartLine::line_total).sum(),
        }
    }

    fn publish(&self, snapshot: CartSnapshot) {
        // send_replace delivers even when no observer is currently attached.
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn selection(id: Uuid, price: Decimal) -> ProductSelection {
        ProductSelection {
            product_id: id,
            name: "Pastrami on rye".to_string(),
            unit_price: price,
            selected_extra_ids: BTreeSet::new(),
        }
    }

    // ==================== Merge Semantics ====================

    #[test]
    fn add_merges_lines_by_product_id() {
        let cart = CartStore::new();
        let id = Uuid::new_v4();

        cart.add(selection(id, dec!(9.50)), 2);
        cart.add(selection(id, dec!(9.50)), 3);

        let lines = cart.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 5);
    }

    #[test]
    fn add_keeps_first_lines_extras_on_merge() {
        let cart = CartStore::new();
        let id = Uuid::new_v4();
        let extra = Uuid::new_v4();

        let mut first = selection(id, dec!(4.00));
        first.selected_extra_ids.insert(extra);
        cart.add(first, 1);

        cart.add(selection(id, dec!(4.00)), 1);

        let lines = cart.lines();
        assert_eq!(lines[0].quantity, 2);
        assert!(lines[0].selected_extra_ids.contains(&extra));
    }

    #[test]
    fn distinct_products_get_distinct_lines() {
        let cart = CartStore::new();
        cart.add(selection(Uuid::new_v4(), dec!(3.25)), 1);
        cart.add(selection(Uuid::new_v4(), dec!(7.75)), 1);
        assert_eq!(cart.lines().len(), 2);
    }

    // ==================== Quantity Clamping ====================

    #[test]
    fn update_quantity_clamps_zero_to_one() {
        let cart = CartStore::new();
        let id = Uuid::new_v4();
        cart.add(selection(id, dec!(2.00)), 4);

        cart.update_quantity(id, 0);

        assert_eq!(cart.lines()[0].quantity, 1);
    }

    #[test]
    fn add_with_zero_quantity_adds_one() {
        let cart = CartStore::new();
        cart.add(selection(Uuid::new_v4(), dec!(2.00)), 0);
        assert_eq!(cart.total_items(), 1);
    }

    // ==================== Totals ====================

    #[test]
    fn totals_follow_lines() {
        let cart = CartStore::new();
        cart.add(selection(Uuid::new_v4(), dec!(10.00)), 2);
        cart.add(selection(Uuid::new_v4(), dec!(5.50)), 1);

        assert_eq!(cart.total_items(), 3);
        assert_eq!(cart.total_price(), dec!(25.50));
    }

    #[test]
    fn clear_empties_and_zeroes() {
        let cart = CartStore::new();
        cart.add(selection(Uuid::new_v4(), dec!(10.00)), 2);
        cart.clear();

        assert!(cart.is_empty());
        assert_eq!(cart.total_items(), 0);
        assert_eq!(cart.total_price(), Decimal::ZERO);
    }

    // ==================== Observation ====================

    #[test]
    fn subscribers_see_mutations_synchronously() {
        let cart = CartStore::new();
        let rx = cart.subscribe();

        cart.add(selection(Uuid::new_v4(), dec!(1.25)), 2);

        // No await needed: the snapshot is published within the mutation.
        let snapshot = rx.borrow();
        assert_eq!(snapshot.total_items, 2);
        assert_eq!(snapshot.total_price, dec!(2.50));
    }

    #[test]
    fn remove_unknown_product_is_noop() {
        let cart = CartStore::new();
        cart.add(selection(Uuid::new_v4(), dec!(1.00)), 1);
        cart.remove(Uuid::new_v4());
        assert_eq!(cart.total_items(), 1);
    }
}
