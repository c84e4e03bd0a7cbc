//! Algorithmic execution: decomposing parent orders into child orders.
//!
//! A parent order with a derived type (TWAP, best-limit chaser, stop) is
//! handed to the [`engine::AlgorithmEngine`], which builds the matching
//! state machine from the [`AlgorithmRegistry`], attaches it to the event
//! router, and drives it with market data, heartbeats, and its own child
//! orders' events until it finishes. Algorithms themselves are pure state
//! machines: callbacks receive a read-only [`ParentView`] and return
//! [`AlgoCommand`]s, which keeps them deterministic and unit-testable.

pub mod algorithm;
pub mod engine;

pub use engine::AlgorithmEngine;

use chrono::{DateTime, Utc};
use janus_core::{Bar, Depth, Heartbeat, Order, OrderStatus, OrderType, Price, Quantity};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlgoError {
    #[error("invalid algorithm parameters: {0}")]
    Params(#[from] serde_json::Error),
    #[error("no algorithm registered for order type {0:?}")]
    Unsupported(OrderType),
    #[error("order {0} is not tracked by the engine")]
    UnknownParent(String),
}

/// Lifecycle of one running algorithm instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgoStatus {
    Working,
    Completed,
    Cancelled,
    Failed(String),
}

impl AlgoStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AlgoStatus::Working)
    }
}

/// A child order as tracked by the engine, with the explicit
/// pending-cancel sub-state: while a cancel is in flight the child still
/// counts as live, so a chaser never double-submits on a depth update
/// that races the cancel acknowledgement.
#[derive(Debug, Clone)]
pub struct ChildOrder {
    pub order: Order,
    pub pending_cancel: bool,
}

impl ChildOrder {
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.order.is_closed()
    }
}

/// Read-only context handed to algorithm callbacks.
pub struct ParentView<'a> {
    pub parent: &'a Order,
    pub children: &'a HashMap<String, ChildOrder>,
    /// Event time: the timestamp of the event being processed, not wall
    /// clock, so backtests drive algorithms deterministically.
    pub now: DateTime<Utc>,
}

impl ParentView<'_> {
    /// The currently live child, if any. Pending-cancel children are
    /// still live: their cancel has not been acknowledged.
    #[must_use]
    pub fn live_child(&self) -> Option<&ChildOrder> {
        self.children.values().find(|c| c.is_live())
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.children.values().filter(|c| c.is_live()).count()
    }

    /// Parent volume not yet executed by any child.
    #[must_use]
    pub fn remaining(&self) -> Quantity {
        self.parent.remaining_volume()
    }
}

/// Instructions an algorithm returns to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AlgoCommand {
    PlaceLimit { price: Price, volume: Quantity },
    PlaceMarket { volume: Quantity },
    Cancel { child_id: String },
    /// Algorithm is done; the engine closes the parent with this status,
    /// cancels any stragglers, and detaches.
    Finish { status: OrderStatus },
}

/// One slicing state machine. Implementations are synchronous and never
/// block; anything slow belongs on the broker's outbound path.
pub trait ExecutionAlgorithm: Send {
    fn on_depth(&mut self, view: &ParentView<'_>, depth: &Depth) -> Result<Vec<AlgoCommand>, AlgoError>;

    fn on_bar(&mut self, _view: &ParentView<'_>, _bar: &Bar) -> Result<Vec<AlgoCommand>, AlgoError> {
        Ok(Vec::new())
    }

    fn on_heartbeat(
        &mut self,
        _view: &ParentView<'_>,
        _beat: &Heartbeat,
    ) -> Result<Vec<AlgoCommand>, AlgoError> {
        Ok(Vec::new())
    }

    /// A child order reached a closed status (filled, cancelled, or
    /// rejected). Transient errors do not close a child and are not
    /// reported here.
    fn on_child_closed(
        &mut self,
        view: &ParentView<'_>,
        child: &Order,
    ) -> Result<Vec<AlgoCommand>, AlgoError>;
}

/// Decode an order's free-form parameter map into a typed params struct.
pub fn decode_params<T: DeserializeOwned>(order: &Order) -> Result<T, AlgoError> {
    let map: serde_json::Map<String, serde_json::Value> = order
        .params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(serde_json::from_value(serde_json::Value::Object(map))?)
}

pub type AlgorithmFactory = fn(&Order) -> Result<Box<dyn ExecutionAlgorithm>, AlgoError>;

/// Explicit order-type → algorithm factory registry, built at startup and
/// passed into the engine.
#[derive(Default)]
pub struct AlgorithmRegistry {
    factories: HashMap<OrderType, AlgorithmFactory>,
}

impl AlgorithmRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in algorithms wired up.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(OrderType::Twap, |order| {
            Ok(Box::new(algorithm::twap::Twap::from_order(order)?))
        });
        registry.register(OrderType::BestLimit, |order| {
            Ok(Box::new(algorithm::best_limit::BestLimit::from_order(order)?))
        });
        registry.register(OrderType::Stop, |order| {
            Ok(Box::new(algorithm::stop::StopTrigger::from_order(order)?))
        });
        registry
    }

    pub fn register(&mut self, order_type: OrderType, factory: AlgorithmFactory) {
        self.factories.insert(order_type, factory);
    }

    pub fn build(&self, order: &Order) -> Result<Box<dyn ExecutionAlgorithm>, AlgoError> {
        match self.factories.get(&order.order_type) {
            Some(factory) => factory(order),
            None => Err(AlgoError::Unsupported(order.order_type)),
        }
    }
}

/// Submission path back into the broker. `send` enters an order request
/// into the broker's full send pipeline (validation, risk, dispatch);
/// `report` publishes an engine-authored order snapshot (parent progress)
/// as an order event.
pub trait OrderSender: Send + Sync {
    fn send(&self, order: Order) -> anyhow::Result<()>;
    fn report(&self, order: Order) -> anyhow::Result<()>;
}
