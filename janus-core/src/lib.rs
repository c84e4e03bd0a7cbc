//! Core data model shared by every janus crate.
//!
//! Prices and quantities are [`rust_decimal::Decimal`] throughout; venue
//! and strategy identifiers are plain strings normalized by the adapters
//! before they reach the engine.

pub mod contract;

pub use contract::{Contract, ContractBook, ContractError, ContractType};

use chrono::{DateTime, Duration, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Monetary price expressed in the quote asset.
pub type Price = Decimal;
/// Order/trade size expressed in the base asset (or contracts).
pub type Quantity = Decimal;
/// Normalized instrument identifier, e.g. `BTCUSDT`.
pub type Symbol = String;

/// Generate a fresh client order id. Client ids are assigned exactly once
/// at order creation and remain the stable key across the OMS, the event
/// router, and algorithm child tracking.
#[must_use]
pub fn next_client_order_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells; used by signed position arithmetic.
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Bar/heartbeat frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    OneSecond,
    OneMinute,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
}

impl Interval {
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Interval::OneSecond => Duration::seconds(1),
            Interval::OneMinute => Duration::minutes(1),
            Interval::FifteenMinutes => Duration::minutes(15),
            Interval::ThirtyMinutes => Duration::minutes(30),
            Interval::OneHour => Duration::hours(1),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::OneSecond => "1s",
            Interval::OneMinute => "1m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
        }
    }

    /// The aligned frequencies due at `ts`, coarsest last. Every timestamp
    /// carries the one-second beat; minute boundaries add the coarser ones.
    #[must_use]
    pub fn due_at(ts: DateTime<Utc>) -> Vec<Interval> {
        let mut due = vec![Interval::OneSecond];
        if ts.second() == 0 {
            due.push(Interval::OneMinute);
            if ts.minute() % 15 == 0 {
                due.push(Interval::FifteenMinutes);
            }
            if ts.minute() % 30 == 0 {
                due.push(Interval::ThirtyMinutes);
            }
            if ts.minute() == 0 {
                due.push(Interval::OneHour);
            }
        }
        due
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1s" => Ok(Interval::OneSecond),
            "1m" => Ok(Interval::OneMinute),
            "15m" => Ok(Interval::FifteenMinutes),
            "30m" => Ok(Interval::ThirtyMinutes),
            "1h" => Ok(Interval::OneHour),
            other => Err(format!("unsupported interval: {other}")),
        }
    }
}

/// Order type. Origin types go straight to a venue; derived types are
/// decomposed into origin-type children by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    Twap,
    BestLimit,
}

impl OrderType {
    #[must_use]
    pub fn is_origin(self) -> bool {
        matches!(self, OrderType::Market | OrderType::Limit)
    }
}

/// Order lifecycle status.
///
/// Closed statuses are final: once an order reports `Filled`, `Cancelled`,
/// or `Rejected` no further update is applied to it. `Error` is live: it
/// marks a transient transport/exchange failure and is resolved by a later
/// status query whose snapshot merges forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Pending,
    PartialFilled,
    Filled,
    Cancelling,
    Cancelled,
    CancelError,
    Error,
    Rejected,
}

impl OrderStatus {
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether the state machine admits moving from `self` to `next`.
    /// Transitions only move forward; nothing leaves a closed status.
    #[must_use]
    pub fn admits(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_closed() {
            return false;
        }
        if self == next {
            // Same-status refresh (e.g. another partial fill).
            return true;
        }
        match self {
            New => !matches!(next, New),
            Pending => matches!(
                next,
                PartialFilled | Filled | Cancelling | Cancelled | Rejected | Error
            ),
            PartialFilled => matches!(next, Filled | Cancelling | Cancelled | Error),
            Cancelling => matches!(next, Cancelled | CancelError | PartialFilled | Filled | Error),
            CancelError => matches!(next, Cancelling | PartialFilled | Filled | Error),
            Error => !matches!(next, New),
            Filled | Cancelled | Rejected => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::New => "new",
            OrderStatus::Pending => "pending",
            OrderStatus::PartialFilled => "partial_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::CancelError => "cancel_error",
            OrderStatus::Error => "error",
            OrderStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A trading order. Created by a strategy or algorithm, mutated only via
/// the broker's event channel; components receive snapshots and mutate
/// fresh clones before re-publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Locally generated id, immutable after creation.
    pub client_order_id: String,
    /// Venue-assigned id, set once on acceptance.
    pub order_id: Option<String>,
    pub exchange: String,
    pub strategy_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Price,
    pub volume: Quantity,
    pub executed_volume: Quantity,
    pub executed_notional: Decimal,
    pub status: OrderStatus,
    /// Free-form algorithm configuration, decoded by the owning algorithm.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        exchange: impl Into<String>,
        strategy_id: impl Into<String>,
        symbol: impl Into<Symbol>,
        side: Side,
        order_type: OrderType,
        price: Price,
        volume: Quantity,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_order_id: next_client_order_id(),
            order_id: None,
            exchange: exchange.into(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side,
            order_type,
            price,
            volume,
            executed_volume: Decimal::ZERO,
            executed_notional: Decimal::ZERO,
            status: OrderStatus::New,
            params: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    #[must_use]
    pub fn remaining_volume(&self) -> Quantity {
        (self.volume - self.executed_volume).max(Decimal::ZERO)
    }

    #[must_use]
    pub fn avg_fill_price(&self) -> Option<Price> {
        if self.executed_volume.is_zero() {
            None
        } else {
            Some(self.executed_notional / self.executed_volume)
        }
    }

    /// Merge a venue/engine snapshot into this tracked copy.
    ///
    /// Information only widens: the venue id is set once, executed
    /// volume/notional are monotone non-decreasing (and capped at the
    /// order volume), and the status is applied only when the state
    /// machine admits the transition. Closed orders ignore every update.
    pub fn absorb(&mut self, update: &Order) {
        if self.status.is_closed() {
            return;
        }
        if self.order_id.is_none() {
            self.order_id.clone_from(&update.order_id);
        }
        if update.executed_volume > self.executed_volume {
            self.executed_volume = update.executed_volume.min(self.volume);
        }
        if update.executed_notional > self.executed_notional {
            self.executed_notional = update.executed_notional;
        }
        if self.status.admits(update.status) {
            self.status = update.status;
        }
        if update.updated_at > self.updated_at {
            self.updated_at = update.updated_at;
        }
    }
}

/// An execution report. Append-only: trades are never mutated after
/// creation, and `(client_order_id, trade_id)` is the uniqueness key the
/// ledger deduplicates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub exchange: String,
    pub strategy_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub volume: Quantity,
    pub commission: Decimal,
    pub commission_asset: String,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.volume
    }

    /// Dedup key: the pair that must be applied at most once.
    #[must_use]
    pub fn dedup_key(&self) -> (String, String) {
        (self.client_order_id.clone(), self.trade_id.clone())
    }
}

/// External cash/asset movement (deposit, withdrawal, funding payment).
/// Applied at most once per `funding_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funding {
    pub funding_id: String,
    pub exchange: String,
    pub strategy_id: String,
    pub asset: String,
    /// Signed amount in the asset's own unit.
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV bar. `timestamp` marks the open of the interval; the bar is
/// considered closed once a strictly later bar or heartbeat of the same
/// frequency arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub exchange: String,
    pub symbol: Symbol,
    pub interval: Interval,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
    pub timestamp: DateTime<Utc>,
}

impl Bar {
    /// The instant this bar settles (open plus one interval), used when
    /// marking positions from bar closes.
    #[must_use]
    pub fn settle_time(&self) -> DateTime<Utc> {
        self.timestamp + self.interval.as_duration()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Price,
    pub volume: Quantity,
}

/// Top-of-book snapshot, five levels per side, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Depth {
    pub exchange: String,
    pub symbol: Symbol,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub timestamp: DateTime<Utc>,
}

impl Depth {
    #[must_use]
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first().map(|l| l.price)
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first().map(|l| l.price)
    }

    /// Book side a resting order of `side` joins passively.
    fn book(&self, side: Side) -> &[DepthLevel] {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Price at `level` on the book side matching `side`. Level 0 is the
    /// best quote on the own side; a negative level mirrors into the
    /// opposite side's book (level -1 on the bid side reads the best ask,
    /// -2 the second ask, and so on).
    #[must_use]
    pub fn price_at(&self, side: Side, level: i32) -> Option<Price> {
        if level >= 0 {
            self.book(side).get(level as usize).map(|l| l.price)
        } else {
            let mirrored = (-level - 1) as usize;
            self.book(side.inverse()).get(mirrored).map(|l| l.price)
        }
    }
}

/// Periodic pulse injected by the scheduler. Algorithms and risk controls
/// subscribe to these rather than polling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub interval: Interval,
}
