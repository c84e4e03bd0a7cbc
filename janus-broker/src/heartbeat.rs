//! Wall-clock heartbeat source for live trading.
//!
//! Ticks once per second and emits one `Heartbeat` event per interval due
//! at that instant, longest schedules piggybacking on the second tick.
//! Backtests do not use this task; the replay loop synthesizes heartbeats
//! from event time instead.

use crate::EventSender;
use chrono::{DurationRound, TimeDelta, Utc};
use janus_core::{Heartbeat, Interval};
use janus_events::EngineEvent;
use tokio::task::JoinHandle;
use tracing::warn;

pub fn spawn_heartbeats(events: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let Ok(timestamp) = now.duration_trunc(TimeDelta::seconds(1)) else {
                continue;
            };
            for interval in Interval::due_at(timestamp) {
                let beat = Heartbeat {
                    timestamp,
                    interval,
                };
                if events.send(EngineEvent::Heartbeat(beat)).is_err() {
                    warn!("broker channel closed, stopping heartbeats");
                    return;
                }
            }
        }
    })
}
