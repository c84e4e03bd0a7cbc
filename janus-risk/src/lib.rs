//! Risk controls: pre-trade order checks and the continuous supervisor.
//!
//! Pre-trade checks run synchronously in the broker's send path with read
//! access to the owning portfolio; a failure rejects the order locally
//! before any venue is contacted. The supervisor runs on the heartbeat
//! and emits actions (close a position, flatten a strategy, disable
//! trading) that the broker executes; it never blocks trading on its own
//! failures.

use janus_core::{Order, Symbol};
use janus_ledger::{Ledger, Portfolio};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RiskBreach {
    #[error("order notional {notional} exceeds cap {limit}")]
    NotionalTooLarge { notional: Decimal, limit: Decimal },
    #[error("{symbol}: projected exposure {projected} exceeds cap {limit}")]
    PositionTooLarge {
        symbol: Symbol,
        projected: Decimal,
        limit: Decimal,
    },
    #[error("trading disabled for strategy {0}")]
    TradingDisabled(String),
}

/// A synchronous pre-trade gate.
pub trait OrderCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, order: &Order, portfolio: &Portfolio) -> Result<(), RiskBreach>;
}

/// Caps the notional of any single order. Market orders carry no price
/// and pass; the venue's own limits are the backstop there.
pub struct MaxNotionalCheck {
    pub limit: Decimal,
}

impl OrderCheck for MaxNotionalCheck {
    fn name(&self) -> &'static str {
        "max_notional"
    }

    fn check(&self, order: &Order, _portfolio: &Portfolio) -> Result<(), RiskBreach> {
        let notional = order.price * order.volume;
        if notional > self.limit {
            return Err(RiskBreach::NotionalTooLarge {
                notional,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// Caps absolute per-symbol exposure after the order would fill.
pub struct MaxPositionCheck {
    pub limit: Decimal,
}

impl OrderCheck for MaxPositionCheck {
    fn name(&self) -> &'static str {
        "max_position"
    }

    fn check(&self, order: &Order, portfolio: &Portfolio) -> Result<(), RiskBreach> {
        let current = portfolio
            .position(&order.symbol)
            .map(|p| p.amount)
            .unwrap_or_default();
        let projected = current + order.side.sign() * order.volume;
        let price = if order.price.is_zero() {
            portfolio
                .position(&order.symbol)
                .map(|p| p.last_price)
                .unwrap_or_default()
        } else {
            order.price
        };
        let exposure = projected.abs() * price;
        if exposure > self.limit {
            return Err(RiskBreach::PositionTooLarge {
                symbol: order.symbol.clone(),
                projected: exposure,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// Run every check in order; the first breach wins.
pub fn run_checks(
    checks: &[Box<dyn OrderCheck>],
    order: &Order,
    portfolio: &Portfolio,
) -> Result<(), RiskBreach> {
    for check in checks {
        check.check(order, portfolio)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Active,
    Off,
}

/// What the broker should do about a breach found on the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskAction {
    ClosePosition { strategy_id: String, symbol: Symbol },
    CloseAll { strategy_id: String },
    DisableTrading { strategy_id: String },
}

/// Continuous controls: per-strategy drawdown kill switch and per-position
/// stop loss, plus the trading-mode gate the kill switch trips.
pub struct RiskSupervisor {
    /// Maximum tolerated drawdown from peak PnL, as a fraction of asset
    /// value. `None` disables the kill switch.
    drawdown_limit: Option<Decimal>,
    /// Maximum tolerated per-position loss as a fraction of position
    /// notional. `None` disables the stop loss.
    position_stop_loss: Option<Decimal>,
    peaks: HashMap<String, Decimal>,
    modes: HashMap<String, TradingMode>,
}

impl RiskSupervisor {
    #[must_use]
    pub fn new(drawdown_limit: Option<Decimal>, position_stop_loss: Option<Decimal>) -> Self {
        Self {
            drawdown_limit,
            position_stop_loss,
            peaks: HashMap::new(),
            modes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn mode(&self, strategy_id: &str) -> TradingMode {
        self.modes.get(strategy_id).copied().unwrap_or_default()
    }

    pub fn set_mode(&mut self, strategy_id: &str, mode: TradingMode) {
        self.modes.insert(strategy_id.to_string(), mode);
    }

    #[must_use]
    pub fn is_active(&self, strategy_id: &str) -> bool {
        self.mode(strategy_id) == TradingMode::Active
    }

    /// Evaluate every strategy. Peak PnL tracking advances even while a
    /// strategy is switched off, but no further actions are emitted for
    /// it.
    pub fn evaluate(&mut self, ledger: &Ledger) -> Vec<RiskAction> {
        let mut actions = Vec::new();
        for portfolio in ledger.portfolios() {
            let strategy_id = portfolio.strategy_id.clone();
            let pnl = portfolio.pnl();
            let peak = self
                .peaks
                .entry(strategy_id.clone())
                .and_modify(|p| *p = (*p).max(pnl.total))
                .or_insert(pnl.total);
            let peak = *peak;
            if !self.is_active(&strategy_id) {
                continue;
            }

            if let Some(limit) = self.drawdown_limit {
                if pnl.asset_value > Decimal::ZERO {
                    let ratio = (pnl.total - peak) / pnl.asset_value;
                    if ratio < -limit {
                        warn!(strategy = %strategy_id, %ratio, %limit, peak = %peak,
                            total = %pnl.total, "drawdown kill switch tripped");
                        self.modes.insert(strategy_id.clone(), TradingMode::Off);
                        actions.push(RiskAction::CloseAll {
                            strategy_id: strategy_id.clone(),
                        });
                        actions.push(RiskAction::DisableTrading { strategy_id });
                        continue;
                    }
                }
            }

            if let Some(threshold) = self.position_stop_loss {
                for position in portfolio.positions() {
                    if position.is_flat() {
                        continue;
                    }
                    let notional = position.notional();
                    if notional.is_zero() {
                        continue;
                    }
                    let ratio = position.unrealized_pnl() / notional;
                    if ratio < -threshold {
                        warn!(strategy = %strategy_id, symbol = %position.symbol,
                            %ratio, %threshold, "position stop loss tripped");
                        actions.push(RiskAction::ClosePosition {
                            strategy_id: strategy_id.clone(),
                            symbol: position.symbol.clone(),
                        });
                    }
                }
            }
        }
        actions
    }
}
