//! Time-weighted average price slicer.

use crate::{decode_params, AlgoCommand, AlgoError, ExecutionAlgorithm, ParentView};
use chrono::{DateTime, Duration, Utc};
use janus_core::{Heartbeat, Order, OrderStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapParams {
    /// Number of equal market slices.
    pub execute_times: u32,
    /// Seconds between consecutive slices.
    pub execute_interval: i64,
}

/// Splits the parent volume into `execute_times` equal market children,
/// one per elapsed `execute_interval`, and finishes once the last slice's
/// child closes. The final slice takes whatever volume remains so lot
/// rounding on earlier slices never strands a remainder.
pub struct Twap {
    params: TwapParams,
    slice_volume: Decimal,
    slices_sent: u32,
    last_slice_at: Option<DateTime<Utc>>,
}

impl Twap {
    pub fn from_order(order: &Order) -> Result<Self, AlgoError> {
        let params: TwapParams = decode_params(order)?;
        let times = Decimal::from(params.execute_times.max(1));
        Ok(Self {
            slice_volume: order.volume / times,
            params,
            slices_sent: 0,
            last_slice_at: None,
        })
    }

    fn interval_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_slice_at {
            None => true,
            Some(last) => now - last >= Duration::seconds(self.params.execute_interval),
        }
    }
}

impl ExecutionAlgorithm for Twap {
    fn on_depth(
        &mut self,
        _view: &ParentView<'_>,
        _depth: &janus_core::Depth,
    ) -> Result<Vec<AlgoCommand>, AlgoError> {
        Ok(Vec::new())
    }

    fn on_heartbeat(
        &mut self,
        view: &ParentView<'_>,
        beat: &Heartbeat,
    ) -> Result<Vec<AlgoCommand>, AlgoError> {
        if self.slices_sent >= self.params.execute_times || !self.interval_elapsed(beat.timestamp) {
            return Ok(Vec::new());
        }
        let is_last = self.slices_sent + 1 == self.params.execute_times;
        let volume = if is_last {
            // Remaining volume net of whatever earlier slices still have
            // in flight.
            let in_flight: Decimal = view
                .children
                .values()
                .filter(|c| c.is_live())
                .map(|c| c.order.remaining_volume())
                .sum();
            (view.remaining() - in_flight).max(Decimal::ZERO)
        } else {
            self.slice_volume
        };
        self.slices_sent += 1;
        self.last_slice_at = Some(beat.timestamp);
        if volume.is_zero() {
            debug!(parent = %view.parent.client_order_id, slice = self.slices_sent,
                "twap slice skipped, nothing left to execute");
            return Ok(Vec::new());
        }
        Ok(vec![AlgoCommand::PlaceMarket { volume }])
    }

    fn on_child_closed(
        &mut self,
        view: &ParentView<'_>,
        _child: &Order,
    ) -> Result<Vec<AlgoCommand>, AlgoError> {
        if self.slices_sent < self.params.execute_times || view.live_count() > 0 {
            return Ok(Vec::new());
        }
        let status = if view.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::Cancelled
        };
        Ok(vec![AlgoCommand::Finish { status }])
    }
}
