//! Stop trigger: dormant until the market touches the trigger price.

use crate::{decode_params, AlgoCommand, AlgoError, ExecutionAlgorithm, ParentView};
use janus_core::{Depth, Order, OrderStatus, Side};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StopParams {}

/// Watches depth until the best tradable price crosses the parent's
/// price (buy: best ask ≥ trigger, sell: best bid ≤ trigger), then
/// submits one limit child at the observed price and waits for it to
/// close.
pub struct StopTrigger {
    triggered: bool,
    finishing: bool,
}

impl StopTrigger {
    pub fn from_order(order: &Order) -> Result<Self, AlgoError> {
        let _params: StopParams = decode_params(order)?;
        Ok(Self {
            triggered: false,
            finishing: false,
        })
    }
}

impl ExecutionAlgorithm for StopTrigger {
    fn on_depth(&mut self, view: &ParentView<'_>, depth: &Depth) -> Result<Vec<AlgoCommand>, AlgoError> {
        if self.triggered || self.finishing {
            return Ok(Vec::new());
        }
        let observed = match view.parent.side {
            Side::Buy => depth.best_ask(),
            Side::Sell => depth.best_bid(),
        };
        let Some(observed) = observed else {
            return Ok(Vec::new());
        };
        let crossed = match view.parent.side {
            Side::Buy => observed >= view.parent.price,
            Side::Sell => observed <= view.parent.price,
        };
        if !crossed {
            return Ok(Vec::new());
        }
        self.triggered = true;
        info!(parent = %view.parent.client_order_id, trigger = %view.parent.price,
            %observed, "stop triggered");
        Ok(vec![AlgoCommand::PlaceLimit {
            price: observed,
            volume: view.remaining(),
        }])
    }

    fn on_child_closed(
        &mut self,
        view: &ParentView<'_>,
        _child: &Order,
    ) -> Result<Vec<AlgoCommand>, AlgoError> {
        if self.finishing {
            return Ok(Vec::new());
        }
        self.finishing = true;
        let status = if view.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::Cancelled
        };
        Ok(vec![AlgoCommand::Finish { status }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use janus_core::{DepthLevel, OrderType};
    use rust_decimal::Decimal;
    use std::collections::HashMap;

    fn depth(bid: i64, ask: i64) -> Depth {
        Depth {
            exchange: "sim".into(),
            symbol: "BTCUSDT".into(),
            bids: vec![DepthLevel {
                price: Decimal::new(bid, 0),
                volume: Decimal::ONE,
            }],
            asks: vec![DepthLevel {
                price: Decimal::new(ask, 0),
                volume: Decimal::ONE,
            }],
            timestamp: Utc::now(),
        }
    }

    fn stop_buy(trigger: i64) -> Order {
        Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::Stop,
            Decimal::new(trigger, 0),
            Decimal::ONE,
        )
    }

    #[test]
    fn stays_dormant_below_trigger() {
        let order = stop_buy(105);
        let mut algo = StopTrigger::from_order(&order).unwrap();
        let children = HashMap::new();
        let d = depth(100, 101);
        let view = ParentView {
            parent: &order,
            children: &children,
            now: d.timestamp,
        };
        assert!(algo.on_depth(&view, &d).unwrap().is_empty());
    }

    #[test]
    fn fires_once_when_crossed() {
        let order = stop_buy(105);
        let mut algo = StopTrigger::from_order(&order).unwrap();
        let children = HashMap::new();
        let d = depth(104, 106);
        let view = ParentView {
            parent: &order,
            children: &children,
            now: d.timestamp,
        };
        let cmds = algo.on_depth(&view, &d).unwrap();
        assert_eq!(
            cmds,
            vec![AlgoCommand::PlaceLimit {
                price: Decimal::new(106, 0),
                volume: Decimal::ONE
            }]
        );
        // Still-crossed depth does not re-fire.
        assert!(algo.on_depth(&view, &d).unwrap().is_empty());
    }

    #[test]
    fn sell_stop_crosses_downward() {
        let mut order = stop_buy(95);
        order.side = Side::Sell;
        let mut algo = StopTrigger::from_order(&order).unwrap();
        let children = HashMap::new();
        let view = ParentView {
            parent: &order,
            children: &children,
            now: Utc::now(),
        };
        assert!(algo.on_depth(&view, &depth(97, 98)).unwrap().is_empty());
        let cmds = algo.on_depth(&view, &depth(94, 96)).unwrap();
        assert_eq!(cmds.len(), 1);
    }
}
