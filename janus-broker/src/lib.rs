//! Broker orchestration: the actor that owns all engine state, the local
//! order tracker, outbound throttling, and the contracts adapters and
//! persistence collaborators implement.

pub mod broker;
pub mod heartbeat;
pub mod limiter;
pub mod oms;

pub use broker::{
    Broker, BrokerBuilder, BrokerCommand, BrokerHandle, BrokerMessage, EventSender, QueryReply,
    QueryRequest,
};
pub use heartbeat::spawn_heartbeats;
pub use limiter::RateLimiter;
pub use oms::OrderTracker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use janus_core::{ContractError, Order, Trade};
use janus_ledger::{Balance, LedgerError, PnL, Position};
use janus_risk::RiskBreach;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broker-facing error taxonomy.
///
/// Validation and risk failures reject locally before any network call;
/// venue rejections close the order `Rejected` without retry; transport
/// failures leave it in `Error` for the caller to resolve; a missing
/// cancel target resolves by re-querying status, never as a hard error.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ContractError),
    #[error("risk check failed: {0}")]
    Risk(#[from] RiskBreach),
    #[error("venue rejected order: {0}")]
    VenueRejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("cancel target not found: {0}")]
    CancelNotFound(String),
    #[error("exchange error: {0}")]
    Exchange(String),
    #[error("no adapter registered for exchange {0}")]
    UnknownExchange(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Per-asset holdings as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub frozen: Decimal,
    pub total: Decimal,
}

/// Contract every exchange connection implements. Adapters normalize
/// everything before it reaches the core: symbols mapped into the
/// internal namespace, UTC timestamps, decimal prices/volumes. Market and
/// execution callbacks flow in through the [`EventSender`] an adapter is
/// constructed with; these methods cover the outbound direction.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Submit an order, returning the venue's updated snapshot.
    async fn create_order(&self, order: Order) -> BrokerResult<Order>;

    /// Request cancellation, returning the venue's updated snapshot.
    async fn cancel_order(&self, order: Order) -> BrokerResult<Order>;

    /// Current venue-side state of an order, used to resolve
    /// cancel-not-found and transient-error outcomes.
    async fn query_order(&self, client_order_id: &str, symbol: &str)
        -> BrokerResult<Option<Order>>;

    async fn fetch_balance(&self) -> BrokerResult<Vec<AssetBalance>>;
}

/// Periodic portfolio state handed to the persistence sink.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub strategy_id: String,
    pub pnl: PnL,
    pub balances: Vec<Balance>,
    pub positions: Vec<Position>,
    pub timestamp: DateTime<Utc>,
}

/// Entities the core hands to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub enum Snapshot {
    Order(Order),
    Trade(Trade),
    Portfolio(PortfolioSnapshot),
}

/// Best-effort persistence side channel: closed orders, accepted trades,
/// and periodic portfolio snapshots. Failures are logged by the broker
/// and never propagate into trading.
pub trait PersistenceSink: Send + Sync {
    fn save(&self, snapshot: Snapshot) -> anyhow::Result<()>;
}

/// Sink that discards everything; the default when no database writer is
/// attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn save(&self, _snapshot: Snapshot) -> anyhow::Result<()> {
        Ok(())
    }
}
