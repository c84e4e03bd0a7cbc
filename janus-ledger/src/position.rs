//! Per-symbol position accounting, polymorphic over contract type.
//!
//! All three variants share the same update contract (apply a trade, mark
//! a price, report unrealized PnL); they differ in how a trade moves the
//! owning portfolio's balances. Spot trades exchange base against quote in
//! full; swap and futures trades settle only realized PnL into the quote
//! balance, with futures scaling by the contract multiplier.

use janus_core::{Contract, ContractType, Price, Quantity, Symbol, Trade};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance movement produced by applying one trade: signed deltas for the
/// contract's base and quote assets, commission excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceDelta {
    pub base: Decimal,
    pub quote: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub strategy_id: String,
    pub symbol: Symbol,
    pub contract_type: ContractType,
    /// Signed size: positive long, negative short. Spot positions stay
    /// non-negative in practice since spot cannot be sold short.
    pub amount: Quantity,
    /// Volume-weighted entry price (cost basis for spot).
    pub entry_price: Price,
    pub realized_pnl: Decimal,
    pub last_price: Price,
    multiplier: Decimal,
}

impl Position {
    #[must_use]
    pub fn new(strategy_id: impl Into<String>, contract: &Contract) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: contract.symbol.clone(),
            contract_type: contract.contract_type,
            amount: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            last_price: Decimal::ZERO,
            multiplier: contract.multiplier,
        }
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.amount.is_zero()
    }

    /// Absolute exposure at the last mark.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.amount.abs() * self.last_price * self.multiplier
    }

    #[must_use]
    pub fn unrealized_pnl(&self) -> Decimal {
        if self.amount.is_zero() || self.last_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.last_price - self.entry_price) * self.amount * self.multiplier
    }

    pub fn mark(&mut self, price: Price) {
        if !price.is_zero() {
            self.last_price = price;
        }
    }

    /// Apply one execution and return the balance deltas the portfolio
    /// must book. Entry price averages while the trade extends the
    /// position; reductions realize PnL against the entry, and a fill
    /// larger than the open amount flips the position, re-opening the
    /// excess at the trade price.
    pub fn apply_trade(&mut self, trade: &Trade) -> BalanceDelta {
        let signed = trade.side.sign() * trade.volume;
        let realized_before = self.realized_pnl;
        self.book(signed, trade.price);
        self.mark(trade.price);
        let realized_delta = self.realized_pnl - realized_before;
        match self.contract_type {
            ContractType::Spot => BalanceDelta {
                base: signed,
                quote: -signed * trade.price,
            },
            ContractType::Swap | ContractType::Futures => BalanceDelta {
                base: Decimal::ZERO,
                quote: realized_delta,
            },
        }
    }

    fn book(&mut self, signed: Quantity, price: Price) {
        if self.amount.is_zero() || self.amount.signum() == signed.signum() {
            // Extending: volume-weight the entry.
            let total = self.amount.abs() + signed.abs();
            if !total.is_zero() {
                self.entry_price = (self.entry_price * self.amount.abs()
                    + price * signed.abs())
                    / total;
            }
            self.amount += signed;
            return;
        }
        let closing = signed.abs().min(self.amount.abs());
        self.realized_pnl +=
            (price - self.entry_price) * closing * self.amount.signum() * self.multiplier;
        self.amount += signed;
        if self.amount.is_zero() {
            self.entry_price = Decimal::ZERO;
        } else if self.amount.signum() == signed.signum() {
            // Flipped through flat; the remainder opens at the trade price.
            self.entry_price = price;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use janus_core::Side;

    fn contract(kind: ContractType) -> Contract {
        let mut c = Contract::spot("BTCUSDT", "BTC", "USDT");
        c.contract_type = kind;
        c
    }

    fn trade(side: Side, price: i64, volume: i64) -> Trade {
        Trade {
            trade_id: "t".into(),
            client_order_id: "c".into(),
            order_id: None,
            exchange: "sim".into(),
            strategy_id: "s1".into(),
            symbol: "BTCUSDT".into(),
            side,
            price: Decimal::new(price, 0),
            volume: Decimal::new(volume, 0),
            commission: Decimal::ZERO,
            commission_asset: "USDT".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn spot_buy_moves_base_and_quote() {
        let mut pos = Position::new("s1", &contract(ContractType::Spot));
        let delta = pos.apply_trade(&trade(Side::Buy, 100, 1));
        assert_eq!(delta.base, Decimal::ONE);
        assert_eq!(delta.quote, Decimal::new(-100, 0));
        assert_eq!(pos.amount, Decimal::ONE);
        assert_eq!(pos.entry_price, Decimal::new(100, 0));
    }

    #[test]
    fn spot_sell_realizes_against_cost_basis() {
        let mut pos = Position::new("s1", &contract(ContractType::Spot));
        pos.apply_trade(&trade(Side::Buy, 100, 2));
        let delta = pos.apply_trade(&trade(Side::Sell, 110, 1));
        assert_eq!(delta.base, Decimal::new(-1, 0));
        assert_eq!(delta.quote, Decimal::new(110, 0));
        assert_eq!(pos.realized_pnl, Decimal::new(10, 0));
        assert_eq!(pos.amount, Decimal::ONE);
    }

    #[test]
    fn entry_price_averages_on_extension() {
        let mut pos = Position::new("s1", &contract(ContractType::Swap));
        pos.apply_trade(&trade(Side::Buy, 100, 1));
        pos.apply_trade(&trade(Side::Buy, 110, 1));
        assert_eq!(pos.entry_price, Decimal::new(105, 0));
        assert_eq!(pos.amount, Decimal::new(2, 0));
    }

    #[test]
    fn swap_settles_realized_pnl_in_quote() {
        let mut pos = Position::new("s1", &contract(ContractType::Swap));
        let open = pos.apply_trade(&trade(Side::Sell, 100, 2));
        assert_eq!(open.base, Decimal::ZERO);
        assert_eq!(open.quote, Decimal::ZERO);
        assert_eq!(pos.amount, Decimal::new(-2, 0));

        let close = pos.apply_trade(&trade(Side::Buy, 90, 2));
        assert_eq!(close.quote, Decimal::new(20, 0));
        assert!(pos.is_flat());
        assert_eq!(pos.entry_price, Decimal::ZERO);
    }

    #[test]
    fn flip_reopens_at_trade_price() {
        let mut pos = Position::new("s1", &contract(ContractType::Swap));
        pos.apply_trade(&trade(Side::Buy, 100, 1));
        pos.apply_trade(&trade(Side::Sell, 120, 3));
        assert_eq!(pos.amount, Decimal::new(-2, 0));
        assert_eq!(pos.entry_price, Decimal::new(120, 0));
        assert_eq!(pos.realized_pnl, Decimal::new(20, 0));
    }

    #[test]
    fn futures_scale_by_multiplier() {
        let mut c = contract(ContractType::Futures);
        c.multiplier = Decimal::new(10, 0);
        let mut pos = Position::new("s1", &c);
        pos.apply_trade(&trade(Side::Buy, 100, 1));
        let close = pos.apply_trade(&trade(Side::Sell, 105, 1));
        assert_eq!(close.quote, Decimal::new(50, 0));
        assert_eq!(pos.realized_pnl, Decimal::new(50, 0));
    }

    #[test]
    fn unrealized_follows_mark() {
        let mut pos = Position::new("s1", &contract(ContractType::Swap));
        pos.apply_trade(&trade(Side::Buy, 100, 2));
        pos.mark(Decimal::new(97, 0));
        assert_eq!(pos.unrealized_pnl(), Decimal::new(-6, 0));
    }
}
