//! Best-limit-price chaser: rests at a configured book level and chases
//! the quote as it improves.

use crate::{decode_params, AlgoCommand, AlgoError, ExecutionAlgorithm, ParentView};
use chrono::{DateTime, Duration, Utc};
use janus_core::{Depth, Heartbeat, Order, OrderStatus, Side};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What to do when retries or the duration budget run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DueAction {
    /// Flatten the remainder with a market child.
    Chase,
    /// Give up and close the parent cancelled.
    #[default]
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestLimitParams {
    /// Book level to rest at: 0 = best own-side quote, negative levels
    /// mirror into the opposite side.
    #[serde(default)]
    pub price_level: i32,
    /// Replacements allowed after a child closes unfilled.
    #[serde(default = "default_n_retry")]
    pub n_retry: u32,
    /// Optional time budget in seconds, measured from the first event.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub due_action: DueAction,
}

fn default_n_retry() -> u32 {
    3
}

/// Chaser state machine. A cancel issued against the live child leaves it
/// pending-cancel (still live) until the venue acknowledges, so a depth
/// tick arriving mid-cancel never triggers a duplicate placement.
pub struct BestLimit {
    params: BestLimitParams,
    retries_used: u32,
    started_at: Option<DateTime<Utc>>,
    /// Duration budget elapsed; resolved by the due action.
    due: bool,
    finishing: bool,
}

impl BestLimit {
    pub fn from_order(order: &Order) -> Result<Self, AlgoError> {
        Ok(Self {
            params: decode_params(order)?,
            retries_used: 0,
            started_at: None,
            due: false,
            finishing: false,
        })
    }

    fn price_improved(&self, side: Side, resting: janus_core::Price, target: janus_core::Price) -> bool {
        match side {
            Side::Buy => target > resting,
            Side::Sell => target < resting,
        }
    }

    fn due_commands(&mut self, view: &ParentView<'_>) -> Vec<AlgoCommand> {
        match self.params.due_action {
            DueAction::Chase => {
                let remaining = view.remaining();
                if remaining.is_zero() {
                    self.finishing = true;
                    vec![AlgoCommand::Finish {
                        status: OrderStatus::Filled,
                    }]
                } else {
                    vec![AlgoCommand::PlaceMarket { volume: remaining }]
                }
            }
            DueAction::Cancel => {
                self.finishing = true;
                vec![AlgoCommand::Finish {
                    status: OrderStatus::Cancelled,
                }]
            }
        }
    }
}

impl ExecutionAlgorithm for BestLimit {
    fn on_depth(&mut self, view: &ParentView<'_>, depth: &Depth) -> Result<Vec<AlgoCommand>, AlgoError> {
        if self.finishing {
            return Ok(Vec::new());
        }
        self.started_at.get_or_insert(depth.timestamp);
        let Some(target) = depth.price_at(view.parent.side, self.params.price_level) else {
            return Ok(Vec::new());
        };
        match view.live_child() {
            None => {
                let remaining = view.remaining();
                if remaining.is_zero() {
                    self.finishing = true;
                    return Ok(vec![AlgoCommand::Finish {
                        status: OrderStatus::Filled,
                    }]);
                }
                Ok(vec![AlgoCommand::PlaceLimit {
                    price: target,
                    volume: remaining,
                }])
            }
            Some(child) if child.pending_cancel => Ok(Vec::new()),
            Some(child) => {
                if self.price_improved(view.parent.side, child.order.price, target) {
                    debug!(parent = %view.parent.client_order_id,
                        child = %child.order.client_order_id,
                        resting = %child.order.price, %target, "chasing improved quote");
                    Ok(vec![AlgoCommand::Cancel {
                        child_id: child.order.client_order_id.clone(),
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    fn on_heartbeat(
        &mut self,
        view: &ParentView<'_>,
        beat: &Heartbeat,
    ) -> Result<Vec<AlgoCommand>, AlgoError> {
        if self.finishing || self.due {
            return Ok(Vec::new());
        }
        let (Some(limit), Some(started)) = (self.params.duration, self.started_at) else {
            return Ok(Vec::new());
        };
        if beat.timestamp - started < Duration::seconds(limit) {
            return Ok(Vec::new());
        }
        self.due = true;
        match view.live_child() {
            // Resolve once the in-flight child comes back.
            Some(child) if !child.pending_cancel => Ok(vec![AlgoCommand::Cancel {
                child_id: child.order.client_order_id.clone(),
            }]),
            Some(_) => Ok(Vec::new()),
            None => Ok(self.due_commands(view)),
        }
    }

    fn on_child_closed(
        &mut self,
        view: &ParentView<'_>,
        child: &Order,
    ) -> Result<Vec<AlgoCommand>, AlgoError> {
        if self.finishing {
            return Ok(Vec::new());
        }
        if view.remaining().is_zero() {
            self.finishing = true;
            return Ok(vec![AlgoCommand::Finish {
                status: OrderStatus::Filled,
            }]);
        }
        if self.due {
            return Ok(self.due_commands(view));
        }
        match child.status {
            OrderStatus::Cancelled | OrderStatus::Rejected => {
                self.retries_used += 1;
                if self.retries_used > self.params.n_retry {
                    Ok(self.due_commands(view))
                } else {
                    // The next depth update re-places at the fresh quote.
                    Ok(Vec::new())
                }
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChildOrder;
    use chrono::Utc;
    use janus_core::{DepthLevel, Interval, OrderType};
    use rust_decimal::Decimal;
    use std::collections::HashMap;

    fn depth(best_bid: i64) -> Depth {
        Depth {
            exchange: "sim".into(),
            symbol: "BTCUSDT".into(),
            bids: vec![DepthLevel {
                price: Decimal::new(best_bid, 0),
                volume: Decimal::ONE,
            }],
            asks: vec![DepthLevel {
                price: Decimal::new(best_bid + 1, 0),
                volume: Decimal::ONE,
            }],
            timestamp: Utc::now(),
        }
    }

    fn parent() -> Order {
        Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::BestLimit,
            Decimal::new(100, 0),
            Decimal::ONE,
        )
    }

    fn child_at(price: i64, pending_cancel: bool) -> (String, ChildOrder) {
        let mut order = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::Limit,
            Decimal::new(price, 0),
            Decimal::ONE,
        );
        order.status = OrderStatus::Pending;
        (
            order.client_order_id.clone(),
            ChildOrder {
                order,
                pending_cancel,
            },
        )
    }

    #[test]
    fn places_at_level_when_idle() {
        let order = parent();
        let mut algo = BestLimit::from_order(&order).unwrap();
        let children = HashMap::new();
        let d = depth(100);
        let view = ParentView {
            parent: &order,
            children: &children,
            now: d.timestamp,
        };
        let cmds = algo.on_depth(&view, &d).unwrap();
        assert_eq!(
            cmds,
            vec![AlgoCommand::PlaceLimit {
                price: Decimal::new(100, 0),
                volume: Decimal::ONE
            }]
        );
    }

    #[test]
    fn cancels_when_quote_improves() {
        let order = parent();
        let mut algo = BestLimit::from_order(&order).unwrap();
        let (id, child) = child_at(100, false);
        let children = HashMap::from([(id.clone(), child)]);
        let d = depth(101);
        let view = ParentView {
            parent: &order,
            children: &children,
            now: d.timestamp,
        };
        let cmds = algo.on_depth(&view, &d).unwrap();
        assert_eq!(cmds, vec![AlgoCommand::Cancel { child_id: id }]);
    }

    #[test]
    fn pending_cancel_suppresses_resend() {
        let order = parent();
        let mut algo = BestLimit::from_order(&order).unwrap();
        let (id, child) = child_at(100, true);
        let children = HashMap::from([(id, child)]);
        let d = depth(102);
        let view = ParentView {
            parent: &order,
            children: &children,
            now: d.timestamp,
        };
        // The cancel is in flight; another improvement must not place or
        // cancel anything.
        assert!(algo.on_depth(&view, &d).unwrap().is_empty());
    }

    #[test]
    fn exhausted_retries_trigger_due_action() {
        let mut order = parent();
        order
            .params
            .insert("n_retry".into(), 1.into());
        order
            .params
            .insert("due_action".into(), "chase".into());
        let mut algo = BestLimit::from_order(&order).unwrap();
        let children = HashMap::new();
        let view = ParentView {
            parent: &order,
            children: &children,
            now: Utc::now(),
        };
        let mut cancelled = parent();
        cancelled.status = OrderStatus::Cancelled;

        // First unfilled close consumes the retry budget quietly.
        assert!(algo.on_child_closed(&view, &cancelled).unwrap().is_empty());
        // Second one breaches it: chase flattens with a market child.
        let cmds = algo.on_child_closed(&view, &cancelled).unwrap();
        assert_eq!(
            cmds,
            vec![AlgoCommand::PlaceMarket {
                volume: Decimal::ONE
            }]
        );
    }

    #[test]
    fn duration_budget_resolves_via_due_action() {
        let mut order = parent();
        order.params.insert("duration".into(), 60.into());
        let mut algo = BestLimit::from_order(&order).unwrap();
        let children = HashMap::new();
        let d = depth(100);
        let view = ParentView {
            parent: &order,
            children: &children,
            now: d.timestamp,
        };
        algo.on_depth(&view, &d).unwrap();

        let late = Heartbeat {
            timestamp: d.timestamp + Duration::seconds(61),
            interval: Interval::OneSecond,
        };
        // Default due action cancels the remainder.
        let cmds = algo.on_heartbeat(&view, &late).unwrap();
        assert_eq!(
            cmds,
            vec![AlgoCommand::Finish {
                status: OrderStatus::Cancelled
            }]
        );
    }

    #[test]
    fn finishes_when_parent_fully_executed() {
        let mut order = parent();
        order.executed_volume = Decimal::ONE;
        let mut algo = BestLimit::from_order(&order).unwrap();
        let children = HashMap::new();
        let view = ParentView {
            parent: &order,
            children: &children,
            now: Utc::now(),
        };
        let mut filled = parent();
        filled.status = OrderStatus::Filled;
        let cmds = algo.on_child_closed(&view, &filled).unwrap();
        assert_eq!(
            cmds,
            vec![AlgoCommand::Finish {
                status: OrderStatus::Filled
            }]
        );
    }
}
