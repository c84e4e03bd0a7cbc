//! Simulated venue for backtests: a matching engine behind the same
//! adapter contract the live connectors implement, so the broker cannot
//! tell the difference.

pub mod backtest;
pub mod matcher;

pub use backtest::{BacktestRunner, MarketEvent};
pub use matcher::{CrossMatcher, MatchReply, Matcher, SimpleMatcher};

use async_trait::async_trait;
use janus_broker::{AssetBalance, BrokerResult, EventSender, ExchangeAdapter};
use janus_core::{Bar, Depth, Order};
use janus_events::EngineEvent;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Exchange adapter wrapping a [`Matcher`]. Market data is pushed in
/// through [`SimExchange::on_bar`]/[`SimExchange::on_depth`], which run
/// the matcher first and publish the input afterwards, so fills caused
/// by an update are applied before the update itself.
pub struct SimExchange {
    matcher: Mutex<Box<dyn Matcher>>,
    events: EventSender,
}

impl SimExchange {
    #[must_use]
    pub fn new(matcher: Box<dyn Matcher>, events: EventSender) -> Self {
        Self {
            matcher: Mutex::new(matcher),
            events,
        }
    }

    fn guard(&self) -> MutexGuard<'_, Box<dyn Matcher>> {
        self.matcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, events: Vec<EngineEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                warn!("broker channel closed, simulated event dropped");
                return;
            }
        }
    }

    pub fn on_bar(&self, bar: Bar) -> BrokerResult<()> {
        let fills = self.guard().on_bar(&bar);
        self.publish(fills);
        self.events.send(EngineEvent::Bar(bar))
    }

    pub fn on_depth(&self, depth: Depth) -> BrokerResult<()> {
        let fills = self.guard().on_depth(&depth);
        self.publish(fills);
        self.events.send(EngineEvent::Depth(depth))
    }
}

#[async_trait]
impl ExchangeAdapter for SimExchange {
    fn name(&self) -> &str {
        "sim"
    }

    async fn create_order(&self, order: Order) -> BrokerResult<Order> {
        let reply = self.guard().submit(order)?;
        self.publish(reply.events);
        Ok(reply.ack)
    }

    async fn cancel_order(&self, order: Order) -> BrokerResult<Order> {
        let reply = self.guard().cancel(order)?;
        self.publish(reply.events);
        Ok(reply.ack)
    }

    async fn query_order(
        &self,
        client_order_id: &str,
        _symbol: &str,
    ) -> BrokerResult<Option<Order>> {
        Ok(self.guard().open_order(client_order_id))
    }

    async fn fetch_balance(&self) -> BrokerResult<Vec<AssetBalance>> {
        Ok(Vec::new())
    }
}
