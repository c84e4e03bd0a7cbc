//! The engine that hosts running algorithm instances.
//!
//! One [`AlgoRunner`] per parent order: it owns the parent snapshot, the
//! child-order table, and the algorithm state machine, and is driven by
//! scoped router subscriptions (depth/bar for its symbol, the global
//! heartbeat, and order/trade topics for each child it places). All
//! driving happens on the broker's consumer thread; the runner mutex only
//! guards against registration races.

use crate::{
    AlgoCommand, AlgoError, AlgoStatus, AlgorithmRegistry, ChildOrder, ExecutionAlgorithm,
    OrderSender, ParentView,
};
use chrono::{DateTime, Utc};
use janus_core::{Order, OrderStatus, OrderType, Price, Quantity};
use janus_events::{EngineEvent, EventKind, EventRouter, Topic};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

struct AlgoRunner {
    parent: Order,
    algo: Box<dyn ExecutionAlgorithm>,
    children: HashMap<String, ChildOrder>,
    seq: u32,
    subscriptions: Vec<(Topic, String)>,
    status: AlgoStatus,
    /// Event time, advanced by market/heartbeat events.
    clock: DateTime<Utc>,
}

struct Inner {
    router: Arc<EventRouter>,
    sender: Arc<dyn OrderSender>,
    registry: AlgorithmRegistry,
    active: Mutex<HashMap<String, Arc<Mutex<AlgoRunner>>>>,
}

/// Supervises one running algorithm per parent order.
pub struct AlgorithmEngine {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl AlgorithmEngine {
    #[must_use]
    pub fn new(
        router: Arc<EventRouter>,
        sender: Arc<dyn OrderSender>,
        registry: AlgorithmRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                router,
                sender,
                registry,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Entry point for order requests. Origin types pass straight through
    /// to the broker pipeline; a derived order either starts an algorithm
    /// (status `New`) or signals a running one to stop (`Cancelling`).
    pub fn send_order(&self, order: Order) -> anyhow::Result<()> {
        if order.order_type.is_origin() {
            return self.inner.sender.send(order);
        }
        match order.status {
            OrderStatus::New => self.spawn(order),
            OrderStatus::Cancelling => {
                if !self.stop(&order.client_order_id) {
                    warn!(client_order_id = %order.client_order_id,
                        "cancel for unknown algorithm ignored");
                }
                Ok(())
            }
            status => {
                warn!(client_order_id = %order.client_order_id, %status,
                    "derived order in unexpected status dropped");
                Ok(())
            }
        }
    }

    /// Number of algorithms currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    fn spawn(&self, order: Order) -> anyhow::Result<()> {
        let algo = self.inner.registry.build(&order)?;
        let mut parent = order;
        parent.status = OrderStatus::Pending;
        let parent_id = parent.client_order_id.clone();
        let symbol = parent.symbol.clone();
        info!(client_order_id = %parent_id, order_type = ?parent.order_type,
            symbol = %symbol, volume = %parent.volume, "starting execution algorithm");

        let runner = Arc::new(Mutex::new(AlgoRunner {
            clock: parent.created_at,
            parent: parent.clone(),
            algo,
            children: HashMap::new(),
            seq: 0,
            subscriptions: Vec::new(),
            status: AlgoStatus::Working,
        }));
        lock(&self.inner.active).insert(parent_id.clone(), Arc::clone(&runner));
        {
            let mut guard = lock(&runner);
            for topic in [
                Topic::scoped(EventKind::Depth, symbol.clone()),
                Topic::scoped(EventKind::Bar, symbol),
                Topic::global(EventKind::Heartbeat),
            ] {
                Inner::attach(&self.inner, &runner, &mut guard, topic);
            }
        }
        self.inner.sender.report(parent)
    }

    /// Stop the algorithm tracked under `client_order_id`, cancelling its
    /// live children and closing the parent. Idempotent: a second stop
    /// finds nothing and returns false.
    pub fn stop(&self, client_order_id: &str) -> bool {
        let Some(runner) = lock(&self.inner.active).get(client_order_id).cloned() else {
            return false;
        };
        let mut guard = lock(&runner);
        if guard.status.is_terminal() {
            return false;
        }
        Inner::finalize(&self.inner, &mut guard, Some(OrderStatus::Cancelled));
        true
    }
}

impl Inner {
    /// Register the runner's drive closure under `topic` and record the
    /// subscription for detach.
    fn attach(
        inner: &Arc<Inner>,
        runner: &Arc<Mutex<AlgoRunner>>,
        guard: &mut AlgoRunner,
        topic: Topic,
    ) {
        let id = format!("algo:{}", guard.parent.client_order_id);
        let inner2 = Arc::clone(inner);
        let runner2 = Arc::clone(runner);
        inner.router.register(topic.clone(), id.clone(), move |event| {
            Inner::drive(&inner2, &runner2, event)
        });
        guard.subscriptions.push((topic, id));
    }

    fn drive(
        inner: &Arc<Inner>,
        runner: &Arc<Mutex<AlgoRunner>>,
        event: &EngineEvent,
    ) -> anyhow::Result<()> {
        let mut guard = lock(runner);
        if guard.status.is_terminal() {
            return Ok(());
        }
        let commands = match Self::dispatch(&mut guard, event) {
            Ok(commands) => commands,
            Err(error) => {
                warn!(client_order_id = %guard.parent.client_order_id, %error,
                    "algorithm error, tearing down");
                Self::finalize(inner, &mut guard, Some(OrderStatus::Cancelled));
                guard.status = AlgoStatus::Failed(error.to_string());
                return Err(error.into());
            }
        };
        Self::execute(inner, runner, &mut guard, commands)?;
        if let EngineEvent::Order(order) = event {
            if guard
                .children
                .get(&order.client_order_id)
                .is_some_and(|child| !child.is_live())
            {
                Self::detach_child(inner, &mut guard, &order.client_order_id);
            }
        }
        // Orphan sweep: if the parent closed without an explicit finish
        // (e.g. an external status merge), drop the runner.
        if guard.parent.is_closed() && !guard.status.is_terminal() {
            Self::finalize(inner, &mut guard, None);
        }
        Ok(())
    }

    fn dispatch(guard: &mut AlgoRunner, event: &EngineEvent) -> Result<Vec<AlgoCommand>, AlgoError> {
        match event {
            EngineEvent::Depth(depth) => {
                guard.clock = depth.timestamp;
                let AlgoRunner {
                    parent,
                    children,
                    algo,
                    clock,
                    ..
                } = guard;
                let view = ParentView {
                    parent,
                    children,
                    now: *clock,
                };
                algo.on_depth(&view, depth)
            }
            EngineEvent::Bar(bar) => {
                guard.clock = bar.settle_time();
                let AlgoRunner {
                    parent,
                    children,
                    algo,
                    clock,
                    ..
                } = guard;
                let view = ParentView {
                    parent,
                    children,
                    now: *clock,
                };
                algo.on_bar(&view, bar)
            }
            EngineEvent::Heartbeat(beat) => {
                guard.clock = beat.timestamp;
                let AlgoRunner {
                    parent,
                    children,
                    algo,
                    clock,
                    ..
                } = guard;
                let view = ParentView {
                    parent,
                    children,
                    now: *clock,
                };
                algo.on_heartbeat(&view, beat)
            }
            EngineEvent::Order(order) => {
                let Some(child) = guard.children.get_mut(&order.client_order_id) else {
                    return Ok(Vec::new());
                };
                child.order.absorb(order);
                if !child.order.is_closed() {
                    return Ok(Vec::new());
                }
                child.pending_cancel = false;
                let snapshot = child.order.clone();
                let AlgoRunner {
                    parent,
                    children,
                    algo,
                    clock,
                    ..
                } = guard;
                let view = ParentView {
                    parent,
                    children,
                    now: *clock,
                };
                algo.on_child_closed(&view, &snapshot)
            }
            EngineEvent::Trade(trade) => {
                if !guard.children.contains_key(&trade.client_order_id) {
                    return Ok(Vec::new());
                }
                let executed = (guard.parent.executed_volume + trade.volume).min(guard.parent.volume);
                guard.parent.executed_volume = executed;
                guard.parent.executed_notional += trade.notional();
                if !guard.parent.remaining_volume().is_zero()
                    && guard.parent.status.admits(OrderStatus::PartialFilled)
                {
                    guard.parent.status = OrderStatus::PartialFilled;
                }
                Ok(Vec::new())
            }
            EngineEvent::Funding(_) => Ok(Vec::new()),
        }
    }

    fn execute(
        inner: &Arc<Inner>,
        runner: &Arc<Mutex<AlgoRunner>>,
        guard: &mut AlgoRunner,
        commands: Vec<AlgoCommand>,
    ) -> anyhow::Result<()> {
        for command in commands {
            match command {
                AlgoCommand::PlaceLimit { price, volume } => {
                    Self::place(inner, runner, guard, OrderType::Limit, price, volume)?;
                }
                AlgoCommand::PlaceMarket { volume } => {
                    Self::place(inner, runner, guard, OrderType::Market, Price::ZERO, volume)?;
                }
                AlgoCommand::Cancel { child_id } => {
                    let Some(child) = guard.children.get_mut(&child_id) else {
                        continue;
                    };
                    if child.pending_cancel || !child.is_live() {
                        continue;
                    }
                    child.pending_cancel = true;
                    let mut request = child.order.clone();
                    request.status = OrderStatus::Cancelling;
                    inner.sender.send(request)?;
                }
                AlgoCommand::Finish { status } => {
                    Self::finalize(inner, guard, Some(status));
                    break;
                }
            }
        }
        Ok(())
    }

    fn place(
        inner: &Arc<Inner>,
        runner: &Arc<Mutex<AlgoRunner>>,
        guard: &mut AlgoRunner,
        order_type: OrderType,
        price: Price,
        volume: Quantity,
    ) -> anyhow::Result<()> {
        guard.seq += 1;
        let parent = &guard.parent;
        let mut child = Order::new(
            parent.exchange.clone(),
            parent.strategy_id.clone(),
            parent.symbol.clone(),
            parent.side,
            order_type,
            price,
            volume,
        );
        child.client_order_id = format!("{}-{}", parent.client_order_id, guard.seq);
        let child_id = child.client_order_id.clone();
        debug!(parent = %parent.client_order_id, child = %child_id,
            order_type = ?order_type, %volume, "placing child order");
        guard
            .children
            .insert(child_id.clone(), ChildOrder {
                order: child.clone(),
                pending_cancel: false,
            });
        Self::attach(inner, runner, guard, Topic::scoped(EventKind::Order, child_id.clone()));
        Self::attach(inner, runner, guard, Topic::scoped(EventKind::Trade, child_id));
        inner.sender.send(child)
    }

    /// Closed children no longer need their order/trade topics; the child
    /// itself stays in the table for volume bookkeeping.
    fn detach_child(inner: &Arc<Inner>, guard: &mut AlgoRunner, child_id: &str) {
        guard.subscriptions.retain(|(topic, id)| {
            if topic.qualifier.as_deref() == Some(child_id) {
                inner.router.unregister(topic, id);
                return false;
            }
            true
        });
    }

    /// Tear the runner down: cancel whatever children are still live,
    /// close the parent (with `final_status` when given), report it, and
    /// detach every subscription.
    fn finalize(inner: &Arc<Inner>, guard: &mut AlgoRunner, final_status: Option<OrderStatus>) {
        for child in guard.children.values_mut() {
            if child.is_live() && !child.pending_cancel {
                child.pending_cancel = true;
                let mut request = child.order.clone();
                request.status = OrderStatus::Cancelling;
                if let Err(error) = inner.sender.send(request) {
                    warn!(child = %child.order.client_order_id, %error,
                        "failed to cancel child during teardown");
                }
            }
        }
        if let Some(status) = final_status {
            if !guard.parent.is_closed() {
                guard.parent.status = status;
            }
        }
        guard.status = match guard.parent.status {
            OrderStatus::Filled => AlgoStatus::Completed,
            _ => AlgoStatus::Cancelled,
        };
        info!(client_order_id = %guard.parent.client_order_id,
            status = %guard.parent.status,
            executed = %guard.parent.executed_volume, "execution algorithm finished");
        if let Err(error) = inner.sender.report(guard.parent.clone()) {
            warn!(%error, "failed to report parent close");
        }
        for (topic, id) in guard.subscriptions.drain(..) {
            inner.router.unregister(&topic, &id);
        }
        lock(&inner.active).remove(&guard.parent.client_order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use janus_core::{Depth, DepthLevel, Heartbeat, Interval, Side, Trade};
    use rust_decimal::Decimal;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Order>>,
        reported: Mutex<Vec<Order>>,
    }

    impl OrderSender for Recorder {
        fn send(&self, order: Order) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(order);
            Ok(())
        }

        fn report(&self, order: Order) -> anyhow::Result<()> {
            self.reported.lock().unwrap().push(order);
            Ok(())
        }
    }

    fn engine() -> (AlgorithmEngine, Arc<EventRouter>, Arc<Recorder>) {
        let router = Arc::new(EventRouter::new());
        let recorder = Arc::new(Recorder::default());
        let engine = AlgorithmEngine::new(
            Arc::clone(&router),
            recorder.clone(),
            AlgorithmRegistry::with_builtins(),
        );
        (engine, router, recorder)
    }

    fn depth(symbol: &str, bid: i64) -> Depth {
        Depth {
            exchange: "sim".into(),
            symbol: symbol.into(),
            bids: vec![DepthLevel {
                price: Decimal::new(bid, 0),
                volume: Decimal::ONE,
            }],
            asks: vec![DepthLevel {
                price: Decimal::new(bid + 1, 0),
                volume: Decimal::ONE,
            }],
            timestamp: Utc::now(),
        }
    }

    fn fill_child(router: &EventRouter, child: &Order, trade_id: &str) {
        let trade = Trade {
            trade_id: trade_id.into(),
            client_order_id: child.client_order_id.clone(),
            order_id: Some("V".into()),
            exchange: child.exchange.clone(),
            strategy_id: child.strategy_id.clone(),
            symbol: child.symbol.clone(),
            side: child.side,
            price: Decimal::new(100, 0),
            volume: child.volume,
            commission: Decimal::ZERO,
            commission_asset: "USDT".into(),
            timestamp: Utc::now(),
        };
        router.publish(
            &Topic::scoped(EventKind::Trade, child.client_order_id.clone()),
            &EngineEvent::Trade(trade),
        );
        let mut closed = child.clone();
        closed.status = OrderStatus::Filled;
        closed.executed_volume = child.volume;
        router.publish(
            &Topic::scoped(EventKind::Order, child.client_order_id.clone()),
            &EngineEvent::Order(closed),
        );
    }

    #[test]
    fn twap_slices_and_closes_parent() {
        // Four 15-minute slices of a volume-4 parent.
        let (engine, router, recorder) = engine();
        let mut parent = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::Twap,
            Decimal::ZERO,
            Decimal::new(4, 0),
        );
        parent.params.insert("execute_times".into(), 4.into());
        parent.params.insert("execute_interval".into(), 900.into());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        parent.created_at = start;
        engine.send_order(parent.clone()).unwrap();
        assert_eq!(engine.active_count(), 1);

        for i in 0..4u32 {
            let beat = Heartbeat {
                timestamp: start + Duration::minutes(i64::from(i) * 15),
                interval: Interval::OneSecond,
            };
            router.publish(
                &Topic::global(EventKind::Heartbeat),
                &EngineEvent::Heartbeat(beat),
            );
            let child = recorder.sent.lock().unwrap().last().cloned().unwrap();
            assert_eq!(child.order_type, OrderType::Market);
            assert_eq!(child.volume, Decimal::ONE);
            fill_child(&router, &child, &format!("T{i}"));
        }

        assert_eq!(recorder.sent.lock().unwrap().len(), 4);
        let last_report = recorder.reported.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last_report.status, OrderStatus::Filled);
        assert_eq!(last_report.executed_volume, Decimal::new(4, 0));
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn chaser_replaces_without_double_submitting() {
        let (engine, router, recorder) = engine();
        let parent = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::BestLimit,
            Decimal::new(100, 0),
            Decimal::ONE,
        );
        engine.send_order(parent).unwrap();

        let depth_topic = Topic::scoped(EventKind::Depth, "BTCUSDT".to_string());
        router.publish(&depth_topic, &EngineEvent::Depth(depth("BTCUSDT", 100)));
        let first_child = recorder.sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(first_child.order_type, OrderType::Limit);
        assert_eq!(first_child.price, Decimal::new(100, 0));

        // Quote improves: a cancel goes out.
        router.publish(&depth_topic, &EngineEvent::Depth(depth("BTCUSDT", 101)));
        let cancel = recorder.sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(cancel.status, OrderStatus::Cancelling);
        assert_eq!(cancel.client_order_id, first_child.client_order_id);

        // Another improvement while the cancel is pending: nothing new.
        let sends_before = recorder.sent.lock().unwrap().len();
        router.publish(&depth_topic, &EngineEvent::Depth(depth("BTCUSDT", 102)));
        assert_eq!(recorder.sent.lock().unwrap().len(), sends_before);

        // Cancel acknowledged; the next depth re-places at the new quote.
        let mut cancelled = first_child.clone();
        cancelled.status = OrderStatus::Cancelled;
        router.publish(
            &Topic::scoped(EventKind::Order, first_child.client_order_id.clone()),
            &EngineEvent::Order(cancelled),
        );
        router.publish(&depth_topic, &EngineEvent::Depth(depth("BTCUSDT", 102)));
        let replacement = recorder.sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(replacement.status, OrderStatus::New);
        assert_eq!(replacement.price, Decimal::new(102, 0));
    }

    #[test]
    fn cancelling_parent_stops_algorithm() {
        let (engine, router, recorder) = engine();
        let parent = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::BestLimit,
            Decimal::new(100, 0),
            Decimal::ONE,
        );
        let parent_id = parent.client_order_id.clone();
        engine.send_order(parent.clone()).unwrap();
        router.publish(
            &Topic::scoped(EventKind::Depth, "BTCUSDT".to_string()),
            &EngineEvent::Depth(depth("BTCUSDT", 100)),
        );
        let child = recorder.sent.lock().unwrap().last().cloned().unwrap();

        let mut cancel = parent;
        cancel.status = OrderStatus::Cancelling;
        engine.send_order(cancel).unwrap();

        // The live child is cancelled and the parent closes.
        let sent = recorder.sent.lock().unwrap();
        let child_cancel = sent
            .iter()
            .find(|o| o.client_order_id == child.client_order_id && o.status == OrderStatus::Cancelling);
        assert!(child_cancel.is_some());
        drop(sent);
        let last_report = recorder.reported.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last_report.client_order_id, parent_id);
        assert_eq!(last_report.status, OrderStatus::Cancelled);
        assert_eq!(engine.active_count(), 0);

        // Stop is idempotent.
        assert!(!engine.stop(&parent_id));
        assert_eq!(
            router.handler_count(&Topic::global(EventKind::Heartbeat)),
            0
        );
    }

    #[test]
    fn closed_children_release_their_subscriptions() {
        let (engine, router, recorder) = engine();
        let mut parent = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::Twap,
            Decimal::ZERO,
            Decimal::new(2, 0),
        );
        parent.params.insert("execute_times".into(), 2.into());
        parent.params.insert("execute_interval".into(), 900.into());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        parent.created_at = start;
        engine.send_order(parent).unwrap();

        router.publish(
            &Topic::global(EventKind::Heartbeat),
            &EngineEvent::Heartbeat(Heartbeat {
                timestamp: start,
                interval: Interval::OneSecond,
            }),
        );
        let child = recorder.sent.lock().unwrap().last().cloned().unwrap();
        let order_topic = Topic::scoped(EventKind::Order, child.client_order_id.clone());
        let trade_topic = Topic::scoped(EventKind::Trade, child.client_order_id.clone());
        assert_eq!(router.handler_count(&order_topic), 1);
        assert_eq!(router.handler_count(&trade_topic), 1);

        fill_child(&router, &child, "T0");

        // Second slice still pending, but the first child's topics are
        // already torn down.
        assert_eq!(engine.active_count(), 1);
        assert_eq!(router.handler_count(&order_topic), 0);
        assert_eq!(router.handler_count(&trade_topic), 0);
    }

    struct Exploding;

    impl ExecutionAlgorithm for Exploding {
        fn on_depth(
            &mut self,
            _view: &ParentView<'_>,
            _depth: &Depth,
        ) -> Result<Vec<AlgoCommand>, AlgoError> {
            Err(AlgoError::UnknownParent("gone".into()))
        }

        fn on_child_closed(
            &mut self,
            _view: &ParentView<'_>,
            _child: &Order,
        ) -> Result<Vec<AlgoCommand>, AlgoError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn algorithm_error_tears_the_runner_down() {
        let router = Arc::new(EventRouter::new());
        let recorder = Arc::new(Recorder::default());
        let mut registry = AlgorithmRegistry::new();
        registry.register(OrderType::Twap, |_| Ok(Box::new(Exploding)));
        let engine = AlgorithmEngine::new(Arc::clone(&router), recorder.clone(), registry);

        let parent = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::Twap,
            Decimal::ZERO,
            Decimal::ONE,
        );
        let parent_id = parent.client_order_id.clone();
        engine.send_order(parent).unwrap();
        router.publish(
            &Topic::scoped(EventKind::Depth, "BTCUSDT".to_string()),
            &EngineEvent::Depth(depth("BTCUSDT", 100)),
        );

        // The runner is gone and the parent was reported cancelled.
        assert_eq!(engine.active_count(), 0);
        let last = recorder.reported.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.client_order_id, parent_id);
        assert_eq!(last.status, OrderStatus::Cancelled);
        assert_eq!(
            router.handler_count(&Topic::global(EventKind::Heartbeat)),
            0
        );
    }

    #[test]
    fn origin_orders_pass_through() {
        let (engine, _router, recorder) = engine();
        let order = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Sell,
            OrderType::Limit,
            Decimal::new(100, 0),
            Decimal::ONE,
        );
        engine.send_order(order.clone()).unwrap();
        assert_eq!(engine.active_count(), 0);
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].client_order_id, order.client_order_id);
    }
}
