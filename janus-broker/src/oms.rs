//! Local order tracker: the authoritative map of in-flight orders.
//!
//! The tracker is read and written both by the broker's consumer task and
//! by adapter callback threads merging venue updates, so every operation
//! takes one exclusive lock across the whole map; check-then-act
//! sequences stay atomic and concurrent callbacks cannot double-insert.

use janus_core::Order;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
pub struct OrderTracker {
    orders: Mutex<HashMap<String, Order>>,
}

impl OrderTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, Order>> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Merge an incoming snapshot by client id and return the tracked
    /// copy after the merge. Unseen orders are stored as-is; tracked open
    /// orders absorb the update; tracked closed orders are immutable and
    /// the update is discarded.
    pub fn on_order(&self, update: &Order) -> Order {
        let mut orders = self.guard();
        match orders.get_mut(&update.client_order_id) {
            Some(tracked) => {
                if tracked.is_closed() {
                    debug!(client_order_id = %update.client_order_id,
                        status = %tracked.status, "update for closed order discarded");
                } else {
                    tracked.absorb(update);
                }
                tracked.clone()
            }
            None => {
                orders.insert(update.client_order_id.clone(), update.clone());
                update.clone()
            }
        }
    }

    /// Detached copy for safe mutation by callers.
    #[must_use]
    pub fn get(&self, client_order_id: &str) -> Option<Order> {
        self.guard().get(client_order_id).cloned()
    }

    /// Remove and return an entry.
    pub fn pop(&self, client_order_id: &str) -> Option<Order> {
        self.guard().remove(client_order_id)
    }

    /// Drop every closed entry, returning how many were removed.
    pub fn purge(&self) -> usize {
        let mut orders = self.guard();
        let before = orders.len();
        orders.retain(|_, order| !order.is_closed());
        before - orders.len()
    }

    #[must_use]
    pub fn open_orders(&self) -> Vec<Order> {
        self.guard()
            .values()
            .filter(|o| !o.is_closed())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}
