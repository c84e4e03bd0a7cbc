//! Event-time replay driver.
//!
//! The broker under test is the same actor the live path runs; the only
//! difference is where events come from. The runner walks a time-ordered
//! market feed, synthesizes the heartbeats a live scheduler would have
//! emitted between consecutive timestamps, and drains the broker after
//! every injection so each input is fully applied, follow-on orders and
//! fills included, before the next one.

use crate::SimExchange;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use janus_broker::Broker;
use janus_core::{Bar, Depth, Heartbeat, Interval};
use janus_events::EngineEvent;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub enum MarketEvent {
    Bar(Bar),
    Depth(Depth),
}

impl MarketEvent {
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MarketEvent::Bar(bar) => bar.timestamp,
            MarketEvent::Depth(depth) => depth.timestamp,
        }
    }
}

pub struct BacktestRunner {
    broker: Broker,
    sim: Arc<SimExchange>,
}

impl BacktestRunner {
    #[must_use]
    pub fn new(broker: Broker, sim: Arc<SimExchange>) -> Self {
        Self { broker, sim }
    }

    /// Replay the feed to completion and hand the broker back for
    /// inspection. The feed is sorted by timestamp first; replay order
    /// is event-time order regardless of input order.
    pub async fn run(mut self, mut feed: Vec<MarketEvent>) -> Broker {
        feed.sort_by_key(MarketEvent::timestamp);
        info!(events = feed.len(), "replay started");
        let events = self.broker.event_sender();
        let mut clock: Option<DateTime<Utc>> = None;
        for event in feed {
            let ts = event.timestamp();
            if self.emit_heartbeats(&events, clock, ts).is_err() {
                error!("broker channel closed mid-replay");
                break;
            }
            self.broker.run_until_idle().await;

            let fed = match event {
                MarketEvent::Bar(bar) => self.sim.on_bar(bar),
                MarketEvent::Depth(depth) => self.sim.on_depth(depth),
            };
            if let Err(err) = fed {
                error!(%err, "replay injection failed");
                break;
            }
            self.broker.run_until_idle().await;
            clock = Some(ts);
        }
        self.broker.run_until_idle().await;
        info!("replay finished");
        self.broker
    }

    /// Emit one heartbeat per due interval for every whole second in
    /// `(prev, ts]`. The first event gets a single leading beat.
    fn emit_heartbeats(
        &self,
        events: &janus_broker::EventSender,
        prev: Option<DateTime<Utc>>,
        ts: DateTime<Utc>,
    ) -> janus_broker::BrokerResult<()> {
        let second = TimeDelta::seconds(1);
        let start = prev.unwrap_or(ts - second);
        let Ok(mut tick) = start.duration_trunc(second) else {
            return Ok(());
        };
        tick += second;
        while tick <= ts {
            for interval in Interval::due_at(tick) {
                events.send(EngineEvent::Heartbeat(Heartbeat {
                    timestamp: tick,
                    interval,
                }))?;
            }
            tick += second;
        }
        Ok(())
    }
}
