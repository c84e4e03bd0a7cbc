//! The broker actor.
//!
//! One task owns every piece of mutable engine state: the order tracker,
//! the ledger, the algorithm engine, risk checks and the supervisor. All
//! inputs arrive over a single channel as [`BrokerMessage`]s, so state
//! mutation is strictly sequential and event application order equals
//! channel arrival order. Slow venue calls never block the consumer: they
//! run on a bounded worker pool and report back through the same channel.

use crate::{
    BrokerError, BrokerResult, ExchangeAdapter, NullSink, OrderTracker, PersistenceSink,
    PortfolioSnapshot, RateLimiter, Snapshot,
};
use chrono::{DateTime, Utc};
use janus_core::{ContractBook, Heartbeat, Interval, Order, OrderStatus, OrderType, Side};
use janus_events::{EngineEvent, EventRouter};
use janus_execution::{AlgorithmEngine, AlgorithmRegistry, OrderSender};
use janus_ledger::{Balance, Ledger, PnL};
use janus_risk::{run_checks, OrderCheck, RiskAction, RiskSupervisor};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

/// Everything the consumer task processes, in arrival order.
pub enum BrokerMessage {
    Event(EngineEvent),
    Command(BrokerCommand),
}

pub enum BrokerCommand {
    Send(Order),
    Cancel { client_order_id: String },
    Query(QueryRequest, oneshot::Sender<QueryReply>),
}

#[derive(Debug, Clone)]
pub enum QueryRequest {
    OpenOrders,
    Pnl { strategy_id: String },
    Balances { strategy_id: String },
}

#[derive(Debug, Clone)]
pub enum QueryReply {
    OpenOrders(Vec<Order>),
    Pnl(Option<PnL>),
    Balances(Vec<Balance>),
}

/// Inbound half handed to adapters and the heartbeat task: everything
/// they observe enters the consumer queue as an event.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl EventSender {
    pub fn send(&self, event: EngineEvent) -> BrokerResult<()> {
        self.tx
            .send(BrokerMessage::Event(event))
            .map_err(|_| BrokerError::Transport("broker channel closed".into()))
    }
}

/// Cloneable command surface for strategies and the algorithm engine.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl BrokerHandle {
    fn command(&self, command: BrokerCommand) -> BrokerResult<()> {
        self.tx
            .send(BrokerMessage::Command(command))
            .map_err(|_| BrokerError::Transport("broker channel closed".into()))
    }

    pub fn send_order(&self, order: Order) -> BrokerResult<()> {
        self.command(BrokerCommand::Send(order))
    }

    pub fn cancel_order(&self, client_order_id: impl Into<String>) -> BrokerResult<()> {
        self.command(BrokerCommand::Cancel {
            client_order_id: client_order_id.into(),
        })
    }

    pub async fn query(&self, request: QueryRequest) -> BrokerResult<QueryReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(BrokerCommand::Query(request, reply_tx))?;
        reply_rx
            .await
            .map_err(|_| BrokerError::Transport("broker dropped query".into()))
    }

    #[must_use]
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }
}

impl OrderSender for BrokerHandle {
    fn send(&self, order: Order) -> anyhow::Result<()> {
        self.send_order(order)?;
        Ok(())
    }

    fn report(&self, order: Order) -> anyhow::Result<()> {
        self.tx
            .send(BrokerMessage::Event(EngineEvent::Order(order)))
            .map_err(|_| anyhow::anyhow!("broker channel closed"))?;
        Ok(())
    }
}

struct Venue {
    adapter: Arc<dyn ExchangeAdapter>,
    limiter: Arc<RateLimiter>,
}

pub struct BrokerBuilder {
    tx: mpsc::UnboundedSender<BrokerMessage>,
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    router: Arc<EventRouter>,
    contracts: Arc<ContractBook>,
    strategies: Vec<(String, String)>,
    deposits: Vec<(String, String, Decimal)>,
    checks: Vec<Box<dyn OrderCheck>>,
    supervisor: RiskSupervisor,
    registry: AlgorithmRegistry,
    venues: HashMap<String, Venue>,
    sink: Arc<dyn PersistenceSink>,
    pool_size: usize,
    snapshot_minutes: u64,
    inline_dispatch: bool,
}

impl BrokerBuilder {
    #[must_use]
    pub fn new(contracts: Arc<ContractBook>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            router: Arc::new(EventRouter::new()),
            contracts,
            strategies: Vec::new(),
            deposits: Vec::new(),
            checks: Vec::new(),
            supervisor: RiskSupervisor::new(None, None),
            registry: AlgorithmRegistry::with_builtins(),
            venues: HashMap::new(),
            sink: Arc::new(NullSink),
            pool_size: 10,
            snapshot_minutes: 30,
            inline_dispatch: false,
        }
    }

    /// Handle for strategies; also usable before `build` so collaborators
    /// can be constructed around it.
    #[must_use]
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            tx: self.tx.clone(),
        }
    }

    #[must_use]
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    #[must_use]
    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    #[must_use]
    pub fn strategy(mut self, strategy_id: &str, accounting_unit: &str) -> Self {
        self.strategies
            .push((strategy_id.to_string(), accounting_unit.to_string()));
        self
    }

    #[must_use]
    pub fn deposit(mut self, strategy_id: &str, asset: &str, amount: Decimal) -> Self {
        self.deposits
            .push((strategy_id.to_string(), asset.to_string(), amount));
        self
    }

    #[must_use]
    pub fn check(mut self, check: Box<dyn OrderCheck>) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn supervisor(mut self, supervisor: RiskSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn adapter(
        mut self,
        adapter: Arc<dyn ExchangeAdapter>,
        permits: usize,
        window: Duration,
    ) -> Self {
        let name = adapter.name().to_string();
        self.venues.insert(
            name,
            Venue {
                adapter,
                limiter: Arc::new(RateLimiter::new(permits, window)),
            },
        );
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn worker_pool(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Minutes between portfolio snapshots handed to the sink; 0 disables
    /// them.
    #[must_use]
    pub fn snapshot_minutes(mut self, minutes: u64) -> Self {
        self.snapshot_minutes = minutes;
        self
    }

    /// Await venue calls inline instead of spawning them. Backtests use
    /// this so `run_until_idle` drains deterministically.
    #[must_use]
    pub fn inline_dispatch(mut self, inline: bool) -> Self {
        self.inline_dispatch = inline;
        self
    }

    #[must_use]
    pub fn build(self) -> Broker {
        let mut ledger = Ledger::new(self.contracts.clone());
        for (strategy_id, accounting_unit) in &self.strategies {
            ledger.add_strategy(strategy_id, accounting_unit);
        }
        for (strategy_id, asset, amount) in &self.deposits {
            if let Some(portfolio) = ledger.portfolio_mut(strategy_id) {
                portfolio.deposit(asset, *amount);
            } else {
                warn!(%strategy_id, "deposit for unknown strategy skipped");
            }
        }
        let handle = BrokerHandle {
            tx: self.tx.clone(),
        };
        let engine = AlgorithmEngine::new(self.router.clone(), Arc::new(handle), self.registry);
        Broker {
            rx: self.rx,
            tx: self.tx,
            router: self.router,
            contracts: self.contracts,
            oms: Arc::new(OrderTracker::new()),
            ledger,
            engine,
            checks: self.checks,
            supervisor: self.supervisor,
            venues: self.venues,
            pool: Arc::new(Semaphore::new(self.pool_size)),
            sink: self.sink,
            snapshot_minutes: self.snapshot_minutes,
            minutes_since_snapshot: 0,
            inline_dispatch: self.inline_dispatch,
        }
    }
}

pub struct Broker {
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
    router: Arc<EventRouter>,
    contracts: Arc<ContractBook>,
    oms: Arc<OrderTracker>,
    ledger: Ledger,
    engine: AlgorithmEngine,
    checks: Vec<Box<dyn OrderCheck>>,
    supervisor: RiskSupervisor,
    venues: HashMap<String, Venue>,
    pool: Arc<Semaphore>,
    sink: Arc<dyn PersistenceSink>,
    snapshot_minutes: u64,
    minutes_since_snapshot: u64,
    inline_dispatch: bool,
}

impl Broker {
    #[must_use]
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            tx: self.tx.clone(),
        }
    }

    #[must_use]
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    #[must_use]
    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    /// Consume messages until every sender is dropped.
    pub async fn run(mut self) {
        info!("broker started");
        while let Some(message) = self.rx.recv().await {
            self.process(message).await;
        }
        info!("broker stopped");
    }

    /// Drain whatever is queued right now and return. Replay drivers call
    /// this between injected events so each input is fully applied,
    /// including the follow-on events it produces, before the next one.
    pub async fn run_until_idle(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.process(message).await;
        }
    }

    async fn process(&mut self, message: BrokerMessage) {
        match message {
            BrokerMessage::Event(event) => self.handle_event(event).await,
            BrokerMessage::Command(command) => self.handle_command(command).await,
        }
    }

    async fn handle_command(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::Send(order) => self.process_send(order, false).await,
            BrokerCommand::Cancel { client_order_id } => {
                self.process_cancel(&client_order_id).await;
            }
            BrokerCommand::Query(request, reply) => {
                if reply.send(self.answer(request)).is_err() {
                    debug!("query caller went away before the reply");
                }
            }
        }
    }

    fn answer(&self, request: QueryRequest) -> QueryReply {
        match request {
            QueryRequest::OpenOrders => QueryReply::OpenOrders(self.oms.open_orders()),
            QueryRequest::Pnl { strategy_id } => QueryReply::Pnl(self.ledger.pnl(&strategy_id)),
            QueryRequest::Balances { strategy_id } => QueryReply::Balances(
                self.ledger
                    .portfolio(&strategy_id)
                    .map(|p| p.balances().cloned().collect())
                    .unwrap_or_default(),
            ),
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Order(order) => self.apply_order(order),
            EngineEvent::Trade(trade) => match self.ledger.on_trade(&trade) {
                Ok(true) => {
                    self.persist(Snapshot::Trade(trade.clone()));
                    self.router.fan_out(
                        &EngineEvent::Trade(trade.clone()),
                        &[&trade.strategy_id, &trade.client_order_id],
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    error!(trade_id = %trade.trade_id, symbol = %trade.symbol, %err,
                        "trade dropped");
                }
            },
            EngineEvent::Bar(bar) => {
                self.ledger.on_bar(&bar);
                self.router
                    .fan_out(&EngineEvent::Bar(bar.clone()), &[&bar.symbol]);
            }
            EngineEvent::Depth(depth) => {
                self.ledger.on_depth(&depth);
                self.router
                    .fan_out(&EngineEvent::Depth(depth.clone()), &[&depth.symbol]);
            }
            EngineEvent::Funding(funding) => {
                if self.ledger.on_funding(&funding) {
                    self.router
                        .fan_out(&EngineEvent::Funding(funding.clone()), &[&funding.strategy_id]);
                }
            }
            EngineEvent::Heartbeat(beat) => self.on_heartbeat(beat).await,
        }
    }

    /// Merge an order snapshot into the tracker, then the ledger, then
    /// fan the merged state out to subscribers.
    fn apply_order(&mut self, order: Order) {
        let tracked = self.oms.on_order(&order);
        if let Err(err) = self.ledger.on_order_status(&tracked) {
            error!(client_order_id = %tracked.client_order_id, %err,
                "ledger rejected order update");
        }
        if tracked.is_closed() {
            self.persist(Snapshot::Order(tracked.clone()));
        }
        self.router.fan_out(
            &EngineEvent::Order(tracked.clone()),
            &[&tracked.strategy_id, &tracked.client_order_id],
        );
    }

    async fn on_heartbeat(&mut self, beat: Heartbeat) {
        let actions = self.supervisor.evaluate(&self.ledger);
        let mut flatten: Vec<Order> = Vec::new();
        for action in actions {
            match action {
                RiskAction::DisableTrading { strategy_id } => {
                    warn!(%strategy_id, "trading disabled by risk supervisor");
                }
                RiskAction::ClosePosition {
                    strategy_id,
                    symbol,
                } => {
                    flatten.extend(self.close_order(&strategy_id, &symbol));
                }
                RiskAction::CloseAll { strategy_id } => {
                    flatten.extend(self.close_all(&strategy_id));
                }
            }
        }
        // Protective flattening bypasses the mode gate the supervisor
        // just engaged.
        for order in flatten {
            warn!(client_order_id = %order.client_order_id, symbol = %order.symbol,
                "submitting protective close");
            self.process_send(order, true).await;
        }

        if beat.interval == Interval::OneMinute {
            let purged = self.oms.purge();
            if purged > 0 {
                debug!(purged, "dropped closed orders from the tracker");
            }
            if self.snapshot_minutes > 0 {
                self.minutes_since_snapshot += 1;
                if self.minutes_since_snapshot >= self.snapshot_minutes {
                    self.minutes_since_snapshot = 0;
                    self.snapshot_portfolios(beat.timestamp);
                }
            }
        }
        self.router
            .fan_out(&EngineEvent::Heartbeat(beat), &[beat.interval.as_str()]);
    }

    fn close_order(&self, strategy_id: &str, symbol: &str) -> Option<Order> {
        let position = self.ledger.portfolio(strategy_id)?.position(symbol)?;
        if position.is_flat() {
            return None;
        }
        let contract = self.contracts.get(symbol).ok()?;
        let side = if position.amount > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        };
        Some(Order::new(
            contract.exchange.clone(),
            strategy_id,
            symbol,
            side,
            OrderType::Market,
            Decimal::ZERO,
            position.amount.abs(),
        ))
    }

    fn close_all(&self, strategy_id: &str) -> Vec<Order> {
        let Some(portfolio) = self.ledger.portfolio(strategy_id) else {
            return Vec::new();
        };
        let symbols: Vec<String> = portfolio
            .positions()
            .filter(|p| !p.is_flat())
            .map(|p| p.symbol.clone())
            .collect();
        symbols
            .iter()
            .filter_map(|symbol| self.close_order(strategy_id, symbol))
            .collect()
    }

    fn snapshot_portfolios(&self, timestamp: DateTime<Utc>) {
        for portfolio in self.ledger.portfolios() {
            self.persist(Snapshot::Portfolio(PortfolioSnapshot {
                strategy_id: portfolio.strategy_id.clone(),
                pnl: portfolio.pnl(),
                balances: portfolio.balances().cloned().collect(),
                positions: portfolio.positions().cloned().collect(),
                timestamp,
            }));
        }
    }

    fn persist(&self, snapshot: Snapshot) {
        if let Err(err) = self.sink.save(snapshot) {
            error!(%err, "persistence write failed");
        }
    }

    /// New orders pass the mode gate, contract validation and pre-trade
    /// checks, then route by type: origin orders go to a venue, derived
    /// orders spawn an algorithm. `force` is reserved for protective
    /// closes, which skip the gate and the checks.
    async fn process_send(&mut self, order: Order, force: bool) {
        if order.status == OrderStatus::Cancelling {
            self.route_cancel(order).await;
            return;
        }
        if order.status != OrderStatus::New {
            warn!(client_order_id = %order.client_order_id, status = %order.status,
                "only new orders can be sent");
            return;
        }
        if !force {
            if !self.supervisor.is_active(&order.strategy_id) {
                self.reject(order, "trading disabled");
                return;
            }
            let contract = match self.contracts.get(&order.symbol) {
                Ok(contract) => contract,
                Err(err) => {
                    self.reject(order, &err.to_string());
                    return;
                }
            };
            if let Err(err) = contract.validate(&order) {
                self.reject(order, &err.to_string());
                return;
            }
            let Some(portfolio) = self.ledger.portfolio(&order.strategy_id) else {
                self.reject(order, "unknown strategy");
                return;
            };
            if let Err(breach) = run_checks(&self.checks, &order, portfolio) {
                self.reject(order, &breach.to_string());
                return;
            }
        }

        if order.order_type.is_origin() {
            self.apply_order(order.clone());
            self.dispatch(order, false).await;
        } else if let Err(err) = self.engine.send_order(order) {
            error!(%err, "algorithm engine refused order");
        }
    }

    async fn process_cancel(&mut self, client_order_id: &str) {
        let Some(tracked) = self.oms.get(client_order_id) else {
            warn!(%client_order_id, "cancel target unknown");
            return;
        };
        if tracked.is_closed() {
            debug!(%client_order_id, status = %tracked.status, "cancel target already closed");
            return;
        }
        let mut request = tracked;
        request.status = OrderStatus::Cancelling;
        self.route_cancel(request).await;
    }

    async fn route_cancel(&mut self, request: Order) {
        if request.order_type.is_origin() {
            self.apply_order(request.clone());
            self.dispatch(request, true).await;
        } else if let Err(err) = self.engine.send_order(request) {
            error!(%err, "algorithm engine refused cancel");
        }
    }

    fn reject(&mut self, mut order: Order, reason: &str) {
        warn!(client_order_id = %order.client_order_id, symbol = %order.symbol, reason,
            "order rejected");
        order.status = OrderStatus::Rejected;
        self.apply_order(order);
    }

    /// Hand an outbound call to the worker pool. The spawned future holds
    /// a pool permit for the duration of the call and acquires a venue
    /// rate-limit slot just before the request goes out; the venue's
    /// answer re-enters the channel as an order event.
    async fn dispatch(&mut self, order: Order, cancel: bool) {
        let Some(venue) = self.venues.get(&order.exchange) else {
            self.reject(order, "no adapter for exchange");
            return;
        };
        let adapter = venue.adapter.clone();
        let limiter = venue.limiter.clone();
        let pool = self.pool.clone();
        let events = self.event_sender();
        let call = async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            limiter.acquire().await;
            let result = if cancel {
                adapter.cancel_order(order.clone()).await
            } else {
                adapter.create_order(order.clone()).await
            };
            let snapshot = match result {
                Ok(snapshot) => snapshot,
                Err(BrokerError::CancelNotFound(_)) => {
                    // The venue no longer knows the order; its terminal
                    // state comes from a status query instead.
                    match adapter.query_order(&order.client_order_id, &order.symbol).await {
                        Ok(Some(snapshot)) => snapshot,
                        Ok(None) => {
                            warn!(client_order_id = %order.client_order_id,
                                "cancel target missing at venue and query came back empty");
                            return;
                        }
                        Err(err) => {
                            error!(client_order_id = %order.client_order_id, %err,
                                "status query after missing cancel target failed");
                            let mut order = order;
                            order.status = OrderStatus::CancelError;
                            order
                        }
                    }
                }
                Err(BrokerError::VenueRejected(reason)) => {
                    warn!(client_order_id = %order.client_order_id, reason = %reason,
                        "venue rejected order");
                    let mut order = order;
                    order.status = OrderStatus::Rejected;
                    order
                }
                Err(err) => {
                    error!(client_order_id = %order.client_order_id, %err, "venue call failed");
                    let mut order = order;
                    order.status = if cancel {
                        OrderStatus::CancelError
                    } else {
                        OrderStatus::Error
                    };
                    order
                }
            };
            if events.send(EngineEvent::Order(snapshot)).is_err() {
                warn!("broker channel closed, venue reply dropped");
            }
        };
        if self.inline_dispatch {
            call.await;
        } else {
            tokio::spawn(call);
        }
    }
}
