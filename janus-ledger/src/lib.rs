//! Per-strategy portfolio and balance accounting.
//!
//! The [`Ledger`] is the single writer for every portfolio once the engine
//! starts: the broker's consumer task feeds it order/trade/funding/market
//! events serially. It owns the idempotence bookkeeping — a trade is
//! applied at most once per `(client_order_id, trade_id)` and a funding
//! event at most once per id — so replayed or duplicated venue callbacks
//! never double-count.

pub mod position;

pub use position::{BalanceDelta, Position};

use janus_core::{
    Bar, ContractBook, ContractError, ContractType, Depth, Funding, Order, Price, Symbol, Trade,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Contract(#[from] ContractError),
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

/// Holdings of one asset for one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub total: Decimal,
    /// Portion reserved against open orders; never exceeds `total`.
    pub frozen: Decimal,
    /// Valuation price in the portfolio's accounting unit.
    pub mark_price: Price,
}

impl Balance {
    #[must_use]
    pub fn new(asset: impl Into<String>, total: Decimal, mark_price: Price) -> Self {
        Self {
            asset: asset.into(),
            total,
            frozen: Decimal::ZERO,
            mark_price,
        }
    }

    #[must_use]
    pub fn available(&self) -> Decimal {
        self.total - self.frozen
    }

    /// Value in the accounting unit at the current mark.
    #[must_use]
    pub fn value(&self) -> Decimal {
        self.total * self.mark_price
    }

    pub fn adjust(&mut self, delta: Decimal) {
        self.total += delta;
    }

    fn freeze(&mut self, amount: Decimal) {
        let clamped = amount.min(self.available()).max(Decimal::ZERO);
        if clamped < amount {
            warn!(asset = %self.asset, requested = %amount, frozen = %clamped,
                "freeze clamped to available balance");
        }
        self.frozen += clamped;
    }

    fn unfreeze(&mut self, amount: Decimal) {
        self.frozen = (self.frozen - amount).max(Decimal::ZERO);
    }
}

/// Aggregate profit and valuation snapshot for one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnL {
    pub realized: Decimal,
    pub unrealized: Decimal,
    pub total: Decimal,
    /// Sum of balances valued at their marks, in the accounting unit.
    pub asset_value: Decimal,
}

/// Positions plus balances for one strategy. Single-writer once built.
#[derive(Debug)]
pub struct Portfolio {
    pub strategy_id: String,
    /// Asset everything is valued in, e.g. `USDT`.
    pub accounting_unit: String,
    contracts: Arc<ContractBook>,
    positions: HashMap<Symbol, Position>,
    balances: HashMap<String, Balance>,
    /// Amount reserved per open origin order, released when it closes.
    frozen_by_order: HashMap<String, (String, Decimal)>,
}

impl Portfolio {
    #[must_use]
    pub fn new(
        strategy_id: impl Into<String>,
        accounting_unit: impl Into<String>,
        contracts: Arc<ContractBook>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            accounting_unit: accounting_unit.into(),
            contracts,
            positions: HashMap::new(),
            balances: HashMap::new(),
            frozen_by_order: HashMap::new(),
        }
    }

    /// Seed initial balances, e.g. from strategy configuration.
    pub fn deposit(&mut self, asset: &str, amount: Decimal) {
        self.balance_mut(asset).adjust(amount);
    }

    fn balance_mut(&mut self, asset: &str) -> &mut Balance {
        let unit = self.accounting_unit.clone();
        self.balances.entry(asset.to_string()).or_insert_with(|| {
            let mark = if asset == unit {
                Decimal::ONE
            } else {
                Decimal::ZERO
            };
            Balance::new(asset, Decimal::ZERO, mark)
        })
    }

    #[must_use]
    pub fn balance(&self, asset: &str) -> Option<&Balance> {
        self.balances.get(asset)
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn balances(&self) -> impl Iterator<Item = &Balance> {
        self.balances.values()
    }

    /// Amount to reserve for an origin order at submission: spot buys
    /// reserve quote notional, spot sells reserve the base volume, and
    /// derivatives reserve quote margin notional. Market orders carry no
    /// price and reserve nothing; the venue is the backstop there.
    fn reservation(&self, order: &Order) -> Result<(String, Decimal)> {
        let contract = self.contracts.get(&order.symbol)?;
        let reserved = match (contract.contract_type, order.side) {
            (ContractType::Spot, janus_core::Side::Buy) => {
                (contract.quote.clone(), order.price * order.volume)
            }
            (ContractType::Spot, janus_core::Side::Sell) => {
                (contract.base.clone(), order.volume)
            }
            (ContractType::Swap | ContractType::Futures, _) => (
                contract.quote.clone(),
                order.price * order.volume * contract.multiplier,
            ),
        };
        Ok(reserved)
    }

    /// Track an order status change. Origin orders reserve balance on
    /// first sight and release it once the order reaches a closed status;
    /// derived parents reserve nothing (their children do).
    pub fn on_order_status(&mut self, order: &Order) -> Result<()> {
        if !order.order_type.is_origin() {
            return Ok(());
        }
        let tracked = self.frozen_by_order.contains_key(&order.client_order_id);
        if !tracked && !order.is_closed() {
            let (asset, amount) = self.reservation(order)?;
            if amount > Decimal::ZERO {
                self.balance_mut(&asset).freeze(amount);
            }
            self.frozen_by_order
                .insert(order.client_order_id.clone(), (asset, amount));
        } else if tracked && order.is_closed() {
            if let Some((asset, amount)) = self.frozen_by_order.remove(&order.client_order_id) {
                if amount > Decimal::ZERO {
                    self.balance_mut(&asset).unfreeze(amount);
                }
            }
        }
        Ok(())
    }

    /// Apply one trade: position update, base/quote balance deltas per the
    /// contract-type rules, commission debit, and mark to the trade price.
    pub fn on_trade(&mut self, trade: &Trade) -> Result<()> {
        let contract = self.contracts.get(&trade.symbol)?.clone();
        let position = self
            .positions
            .entry(trade.symbol.clone())
            .or_insert_with(|| Position::new(trade.strategy_id.clone(), &contract));
        let delta = position.apply_trade(trade);

        if !delta.base.is_zero() {
            self.balance_mut(&contract.base).adjust(delta.base);
        }
        if !delta.quote.is_zero() {
            self.balance_mut(&contract.quote).adjust(delta.quote);
        }
        if !trade.commission.is_zero() {
            self.balance_mut(&trade.commission_asset)
                .adjust(-trade.commission);
        }
        Ok(())
    }

    /// Apply an external asset movement directly to the named balance.
    pub fn on_funding(&mut self, funding: &Funding) {
        self.balance_mut(&funding.asset).adjust(funding.volume);
    }

    /// Mark positions and balance valuations from a settled bar close.
    pub fn on_bar(&mut self, bar: &Bar) {
        if let Some(position) = self.positions.get_mut(&bar.symbol) {
            position.mark(bar.close);
        }
        if let Ok(contract) = self.contracts.get(&bar.symbol) {
            if contract.quote == self.accounting_unit {
                if let Some(balance) = self.balances.get_mut(&contract.base) {
                    balance.mark_price = bar.close;
                }
            }
        }
    }

    /// Mark the symbol's position (and base-asset valuation) from the
    /// best bid of a depth snapshot.
    pub fn on_depth(&mut self, depth: &Depth) {
        let Some(best_bid) = depth.best_bid() else {
            return;
        };
        if let Some(position) = self.positions.get_mut(&depth.symbol) {
            position.mark(best_bid);
        }
        if let Ok(contract) = self.contracts.get(&depth.symbol) {
            if contract.quote == self.accounting_unit {
                if let Some(balance) = self.balances.get_mut(&contract.base) {
                    balance.mark_price = best_bid;
                }
            }
        }
    }

    #[must_use]
    pub fn pnl(&self) -> PnL {
        let realized: Decimal = self.positions.values().map(|p| p.realized_pnl).sum();
        let unrealized: Decimal = self.positions.values().map(Position::unrealized_pnl).sum();
        let asset_value: Decimal = self.balances.values().map(Balance::value).sum();
        PnL {
            realized,
            unrealized,
            total: realized + unrealized,
            asset_value,
        }
    }
}

/// All portfolios plus the idempotence bookkeeping shared across them.
#[derive(Debug)]
pub struct Ledger {
    contracts: Arc<ContractBook>,
    portfolios: HashMap<String, Portfolio>,
    applied_trades: HashSet<(String, String)>,
    applied_funding: HashSet<String>,
}

impl Ledger {
    #[must_use]
    pub fn new(contracts: Arc<ContractBook>) -> Self {
        Self {
            contracts,
            portfolios: HashMap::new(),
            applied_trades: HashSet::new(),
            applied_funding: HashSet::new(),
        }
    }

    pub fn add_strategy(&mut self, strategy_id: &str, accounting_unit: &str) -> &mut Portfolio {
        let contracts = self.contracts.clone();
        self.portfolios
            .entry(strategy_id.to_string())
            .or_insert_with(|| Portfolio::new(strategy_id, accounting_unit, contracts))
    }

    #[must_use]
    pub fn portfolio(&self, strategy_id: &str) -> Option<&Portfolio> {
        self.portfolios.get(strategy_id)
    }

    pub fn portfolio_mut(&mut self, strategy_id: &str) -> Option<&mut Portfolio> {
        self.portfolios.get_mut(strategy_id)
    }

    pub fn portfolios(&self) -> impl Iterator<Item = &Portfolio> {
        self.portfolios.values()
    }

    pub fn on_order_status(&mut self, order: &Order) -> Result<()> {
        match self.portfolios.get_mut(&order.strategy_id) {
            Some(portfolio) => portfolio.on_order_status(order),
            None => {
                warn!(strategy = %order.strategy_id, client_order_id = %order.client_order_id,
                    "order event for unknown strategy dropped");
                Ok(())
            }
        }
    }

    /// Apply a trade at most once. Returns `Ok(false)` — with no side
    /// effects whatsoever — when the `(client_order_id, trade_id)` pair
    /// has been seen before.
    pub fn on_trade(&mut self, trade: &Trade) -> Result<bool> {
        let key = trade.dedup_key();
        if self.applied_trades.contains(&key) {
            debug!(trade_id = %trade.trade_id, client_order_id = %trade.client_order_id,
                "duplicate trade dropped");
            return Ok(false);
        }
        let Some(portfolio) = self.portfolios.get_mut(&trade.strategy_id) else {
            warn!(strategy = %trade.strategy_id, trade_id = %trade.trade_id,
                "trade for unknown strategy dropped");
            return Ok(false);
        };
        portfolio.on_trade(trade)?;
        self.applied_trades.insert(key);
        Ok(true)
    }

    /// Apply a funding movement at most once per funding id.
    pub fn on_funding(&mut self, funding: &Funding) -> bool {
        if self.applied_funding.contains(&funding.funding_id) {
            debug!(funding_id = %funding.funding_id, "duplicate funding dropped");
            return false;
        }
        let Some(portfolio) = self.portfolios.get_mut(&funding.strategy_id) else {
            warn!(strategy = %funding.strategy_id, funding_id = %funding.funding_id,
                "funding for unknown strategy dropped");
            return false;
        };
        portfolio.on_funding(funding);
        self.applied_funding.insert(funding.funding_id.clone());
        true
    }

    pub fn on_bar(&mut self, bar: &Bar) {
        for portfolio in self.portfolios.values_mut() {
            portfolio.on_bar(bar);
        }
    }

    pub fn on_depth(&mut self, depth: &Depth) {
        for portfolio in self.portfolios.values_mut() {
            portfolio.on_depth(depth);
        }
    }

    #[must_use]
    pub fn pnl(&self, strategy_id: &str) -> Option<PnL> {
        self.portfolios.get(strategy_id).map(Portfolio::pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use janus_core::{Contract, Order, OrderStatus, OrderType, Side};

    fn book() -> Arc<ContractBook> {
        ContractBook::shared([Contract::spot("BTCUSDT", "BTC", "USDT")])
    }

    fn ledger_with_funds() -> Ledger {
        let mut ledger = Ledger::new(book());
        ledger
            .add_strategy("s1", "USDT")
            .deposit("USDT", Decimal::new(1000, 0));
        ledger
    }

    fn buy_limit() -> Order {
        let mut order = Order::new(
            "sim",
            "s1",
            "BTCUSDT",
            Side::Buy,
            OrderType::Limit,
            Decimal::new(100, 0),
            Decimal::ONE,
        );
        order.status = OrderStatus::Pending;
        order.order_id = Some("X".into());
        order
    }

    fn fill_trade(order: &Order) -> Trade {
        Trade {
            trade_id: "T1".into(),
            client_order_id: order.client_order_id.clone(),
            order_id: order.order_id.clone(),
            exchange: "sim".into(),
            strategy_id: "s1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            price: Decimal::new(100, 0),
            volume: Decimal::ONE,
            commission: Decimal::new(1, 1),
            commission_asset: "USDT".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn fill_flows_into_position_and_balances() {
        // Scenario: buy 1 BTC at 100 with 0.1 USDT commission.
        let mut ledger = ledger_with_funds();
        let mut order = buy_limit();
        ledger.on_order_status(&order).unwrap();

        let portfolio = ledger.portfolio("s1").unwrap();
        assert_eq!(
            portfolio.balance("USDT").unwrap().frozen,
            Decimal::new(100, 0)
        );

        assert!(ledger.on_trade(&fill_trade(&order)).unwrap());
        order.status = OrderStatus::Filled;
        order.executed_volume = Decimal::ONE;
        ledger.on_order_status(&order).unwrap();

        let portfolio = ledger.portfolio("s1").unwrap();
        assert_eq!(portfolio.position("BTCUSDT").unwrap().amount, Decimal::ONE);
        let usdt = portfolio.balance("USDT").unwrap();
        assert_eq!(usdt.total, Decimal::new(8999, 1)); // 1000 - 100 - 0.1
        assert_eq!(usdt.frozen, Decimal::ZERO);
        assert_eq!(portfolio.balance("BTC").unwrap().total, Decimal::ONE);
    }

    #[test]
    fn duplicate_trade_has_no_effect() {
        let mut ledger = ledger_with_funds();
        let order = buy_limit();
        ledger.on_order_status(&order).unwrap();
        let trade = fill_trade(&order);

        assert!(ledger.on_trade(&trade).unwrap());
        let usdt_after = ledger
            .portfolio("s1")
            .unwrap()
            .balance("USDT")
            .unwrap()
            .total;
        let btc_after = ledger
            .portfolio("s1")
            .unwrap()
            .balance("BTC")
            .unwrap()
            .total;

        assert!(!ledger.on_trade(&trade).unwrap());
        let portfolio = ledger.portfolio("s1").unwrap();
        assert_eq!(portfolio.balance("USDT").unwrap().total, usdt_after);
        assert_eq!(portfolio.balance("BTC").unwrap().total, btc_after);
        assert_eq!(portfolio.position("BTCUSDT").unwrap().amount, Decimal::ONE);
    }

    #[test]
    fn funding_applies_once_per_id() {
        let mut ledger = ledger_with_funds();
        let funding = Funding {
            funding_id: "F1".into(),
            exchange: "sim".into(),
            strategy_id: "s1".into(),
            asset: "USDT".into(),
            volume: Decimal::new(50, 0),
            timestamp: Utc::now(),
        };
        assert!(ledger.on_funding(&funding));
        assert!(!ledger.on_funding(&funding));
        assert_eq!(
            ledger.portfolio("s1").unwrap().balance("USDT").unwrap().total,
            Decimal::new(1050, 0)
        );
    }

    #[test]
    fn freeze_released_only_on_close() {
        let mut ledger = ledger_with_funds();
        let mut order = buy_limit();
        ledger.on_order_status(&order).unwrap();

        // Transient error keeps the reservation in place.
        order.status = OrderStatus::Error;
        ledger.on_order_status(&order).unwrap();
        assert_eq!(
            ledger.portfolio("s1").unwrap().balance("USDT").unwrap().frozen,
            Decimal::new(100, 0)
        );

        order.status = OrderStatus::Cancelled;
        ledger.on_order_status(&order).unwrap();
        assert_eq!(
            ledger.portfolio("s1").unwrap().balance("USDT").unwrap().frozen,
            Decimal::ZERO
        );
    }

    #[test]
    fn derived_orders_reserve_nothing() {
        let mut ledger = ledger_with_funds();
        let mut order = buy_limit();
        order.order_type = OrderType::Twap;
        ledger.on_order_status(&order).unwrap();
        assert_eq!(
            ledger.portfolio("s1").unwrap().balance("USDT").unwrap().frozen,
            Decimal::ZERO
        );
    }

    #[test]
    fn marks_update_from_bar_and_depth() {
        let mut ledger = ledger_with_funds();
        let order = buy_limit();
        ledger.on_order_status(&order).unwrap();
        ledger.on_trade(&fill_trade(&order)).unwrap();

        let bar = Bar {
            exchange: "sim".into(),
            symbol: "BTCUSDT".into(),
            interval: janus_core::Interval::OneMinute,
            open: Decimal::new(100, 0),
            high: Decimal::new(106, 0),
            low: Decimal::new(99, 0),
            close: Decimal::new(105, 0),
            volume: Decimal::ONE,
            timestamp: Utc::now(),
        };
        ledger.on_bar(&bar);
        let portfolio = ledger.portfolio("s1").unwrap();
        assert_eq!(
            portfolio.position("BTCUSDT").unwrap().last_price,
            Decimal::new(105, 0)
        );
        assert_eq!(
            portfolio.balance("BTC").unwrap().mark_price,
            Decimal::new(105, 0)
        );
        // 899.9 USDT + 1 BTC valued at 105.
        assert_eq!(portfolio.pnl().asset_value, Decimal::new(10049, 1));
    }

    #[test]
    fn unknown_symbol_contract_is_fatal() {
        let mut ledger = ledger_with_funds();
        let mut order = buy_limit();
        order.symbol = "ETHUSDT".into();
        assert!(ledger.on_order_status(&order).is_err());
    }
}
