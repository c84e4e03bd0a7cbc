//! Deterministic fill generation for backtests.
//!
//! Two strategies share one trait: the simple matcher fills everything
//! instantly at the stated price plus slippage, the cross matcher rests
//! orders until a bar or book update actually crosses them. Both
//! synthesize the same trade/order events the live path produces, so
//! nothing downstream can tell a simulated fill from a real one.

use chrono::{DateTime, Utc};
use janus_broker::{BrokerError, BrokerResult};
use janus_core::{Bar, ContractBook, Depth, Order, OrderStatus, OrderType, Price, Side, Symbol};
use janus_events::EngineEvent;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Immediate answer to a submit or cancel: the snapshot handed back to
/// the broker plus any follow-on events (fills) to publish first.
pub struct MatchReply {
    pub ack: Order,
    pub events: Vec<EngineEvent>,
}

impl MatchReply {
    fn ack_only(ack: Order) -> Self {
        Self {
            ack,
            events: Vec::new(),
        }
    }
}

pub trait Matcher: Send + Sync {
    fn submit(&mut self, order: Order) -> BrokerResult<MatchReply>;
    fn cancel(&mut self, order: Order) -> BrokerResult<MatchReply>;
    fn on_bar(&mut self, bar: &Bar) -> Vec<EngineEvent>;
    fn on_depth(&mut self, depth: &Depth) -> Vec<EngineEvent>;
    /// Resting state of an order, if the matcher still knows it.
    fn open_order(&self, client_order_id: &str) -> Option<Order>;
}

/// Shared id and trade fabrication.
struct MatchDesk {
    contracts: Arc<ContractBook>,
    fee_rate: Decimal,
    order_seq: u64,
    trade_seq: u64,
}

impl MatchDesk {
    fn new(contracts: Arc<ContractBook>, fee_rate: Decimal) -> Self {
        Self {
            contracts,
            fee_rate,
            order_seq: 0,
            trade_seq: 0,
        }
    }

    fn accept(&mut self, order: &mut Order) -> BrokerResult<()> {
        self.contracts.get(&order.symbol)?;
        self.order_seq += 1;
        order.order_id = Some(format!("sim-{}", self.order_seq));
        order.status = OrderStatus::Pending;
        Ok(())
    }

    /// Fills are always full; emit the trade first so the ledger books
    /// the position before the closing order status releases funds.
    fn fill(
        &mut self,
        order: &Order,
        price: Price,
        timestamp: DateTime<Utc>,
    ) -> BrokerResult<(Order, Vec<EngineEvent>)> {
        let quote = self.contracts.get(&order.symbol)?.quote.clone();
        self.trade_seq += 1;
        let notional = price * order.volume;
        let trade = janus_core::Trade {
            trade_id: format!("sim-t-{}", self.trade_seq),
            client_order_id: order.client_order_id.clone(),
            order_id: order.order_id.clone(),
            exchange: order.exchange.clone(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            volume: order.volume,
            commission: notional * self.fee_rate,
            commission_asset: quote,
            timestamp,
        };
        let mut filled = order.clone();
        filled.status = OrderStatus::Filled;
        filled.executed_volume = order.volume;
        filled.executed_notional = notional;
        filled.updated_at = timestamp;
        debug!(client_order_id = %order.client_order_id, %price, volume = %order.volume,
            "simulated fill");
        Ok((filled, vec![EngineEvent::Trade(trade)]))
    }
}

/// Fills every order the moment it arrives, at its stated price adjusted
/// by a slippage fraction. Market orders fill at the last observed price.
pub struct SimpleMatcher {
    desk: MatchDesk,
    slippage: Decimal,
    last_prices: HashMap<Symbol, Price>,
}

impl SimpleMatcher {
    #[must_use]
    pub fn new(contracts: Arc<ContractBook>, slippage: Decimal, fee_rate: Decimal) -> Self {
        Self {
            desk: MatchDesk::new(contracts, fee_rate),
            slippage,
            last_prices: HashMap::new(),
        }
    }

    fn fill_price(&self, order: &Order) -> BrokerResult<Price> {
        let reference = if order.order_type == OrderType::Market {
            *self.last_prices.get(&order.symbol).ok_or_else(|| {
                BrokerError::VenueRejected(format!("no reference price for {}", order.symbol))
            })?
        } else {
            order.price
        };
        let slipped = match order.side {
            Side::Buy => reference * (Decimal::ONE + self.slippage),
            Side::Sell => reference * (Decimal::ONE - self.slippage),
        };
        Ok(slipped)
    }
}

impl Matcher for SimpleMatcher {
    fn submit(&mut self, mut order: Order) -> BrokerResult<MatchReply> {
        self.desk.accept(&mut order)?;
        let price = self.fill_price(&order)?;
        let (filled, events) = self.desk.fill(&order, price, Utc::now())?;
        Ok(MatchReply {
            ack: filled,
            events,
        })
    }

    // Nothing ever rests, so a cancel just acknowledges.
    fn cancel(&mut self, mut order: Order) -> BrokerResult<MatchReply> {
        order.status = OrderStatus::Cancelled;
        Ok(MatchReply::ack_only(order))
    }

    fn on_bar(&mut self, bar: &Bar) -> Vec<EngineEvent> {
        self.last_prices.insert(bar.symbol.clone(), bar.close);
        Vec::new()
    }

    fn on_depth(&mut self, depth: &Depth) -> Vec<EngineEvent> {
        if let Some(price) = depth.best_bid().or_else(|| depth.best_ask()) {
            self.last_prices.insert(depth.symbol.clone(), price);
        }
        Vec::new()
    }

    fn open_order(&self, _client_order_id: &str) -> Option<Order> {
        None
    }
}

/// Rests orders per symbol in arrival order and fills them when market
/// data crosses their limit price.
pub struct CrossMatcher {
    desk: MatchDesk,
    resting: HashMap<Symbol, Vec<Order>>,
}

impl CrossMatcher {
    #[must_use]
    pub fn new(contracts: Arc<ContractBook>, fee_rate: Decimal) -> Self {
        Self {
            desk: MatchDesk::new(contracts, fee_rate),
            resting: HashMap::new(),
        }
    }

    /// Fill price against a bar, or `None` when the bar does not cross
    /// the order. Limit fills realize at the bar's open, clipped so they
    /// are never worse than the limit.
    fn cross_bar(order: &Order, bar: &Bar) -> Option<Price> {
        if order.order_type == OrderType::Market {
            return Some(bar.open);
        }
        match order.side {
            Side::Buy if order.price >= bar.low => Some(order.price.min(bar.open)),
            Side::Sell if order.price <= bar.high => Some(order.price.max(bar.open)),
            _ => None,
        }
    }

    /// Fill price against the book: the touch on the far side is both
    /// the cross threshold and the realized price.
    fn cross_depth(order: &Order, depth: &Depth) -> Option<Price> {
        let touch = match order.side {
            Side::Buy => depth.best_ask()?,
            Side::Sell => depth.best_bid()?,
        };
        if order.order_type == OrderType::Market {
            return Some(touch);
        }
        match order.side {
            Side::Buy if touch <= order.price => Some(touch),
            Side::Sell if touch >= order.price => Some(touch),
            _ => None,
        }
    }

    fn sweep<F>(&mut self, symbol: &str, timestamp: DateTime<Utc>, cross: F) -> Vec<EngineEvent>
    where
        F: Fn(&Order) -> Option<Price>,
    {
        let Some(book) = self.resting.get_mut(symbol) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let mut kept = Vec::with_capacity(book.len());
        for order in book.drain(..) {
            let Some(price) = cross(&order) else {
                kept.push(order);
                continue;
            };
            match self.desk.fill(&order, price, timestamp) {
                Ok((filled, mut fill_events)) => {
                    events.append(&mut fill_events);
                    events.push(EngineEvent::Order(filled));
                }
                Err(err) => {
                    debug!(client_order_id = %order.client_order_id, %err,
                        "fill failed, order stays resting");
                    kept.push(order);
                }
            }
        }
        *book = kept;
        events
    }
}

impl Matcher for CrossMatcher {
    fn submit(&mut self, mut order: Order) -> BrokerResult<MatchReply> {
        self.desk.accept(&mut order)?;
        self.resting
            .entry(order.symbol.clone())
            .or_default()
            .push(order.clone());
        Ok(MatchReply::ack_only(order))
    }

    fn cancel(&mut self, order: Order) -> BrokerResult<MatchReply> {
        let book = self
            .resting
            .get_mut(&order.symbol)
            .ok_or_else(|| BrokerError::CancelNotFound(order.client_order_id.clone()))?;
        let index = book
            .iter()
            .position(|resting| resting.client_order_id == order.client_order_id)
            .ok_or_else(|| BrokerError::CancelNotFound(order.client_order_id.clone()))?;
        let mut cancelled = book.remove(index);
        cancelled.status = OrderStatus::Cancelled;
        Ok(MatchReply::ack_only(cancelled))
    }

    fn on_bar(&mut self, bar: &Bar) -> Vec<EngineEvent> {
        self.sweep(&bar.symbol, bar.timestamp, |order| Self::cross_bar(order, bar))
    }

    fn on_depth(&mut self, depth: &Depth) -> Vec<EngineEvent> {
        self.sweep(&depth.symbol, depth.timestamp, |order| {
            Self::cross_depth(order, depth)
        })
    }

    fn open_order(&self, client_order_id: &str) -> Option<Order> {
        self.resting
            .values()
            .flatten()
            .find(|order| order.client_order_id == client_order_id)
            .cloned()
    }
}
