//! Static per-symbol reference data and the contract registry.
//!
//! Contracts are loaded once at startup and shared read-only; every
//! pricing/sizing decision looks its contract up by symbol, and an unknown
//! symbol is a configuration error, not a runtime condition to tolerate.

use crate::{Order, OrderType, Price, Quantity, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Spot,
    Swap,
    Futures,
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("no contract loaded for symbol {0}")]
    UnknownSymbol(Symbol),
    #[error("{symbol}: volume {volume} outside [{min}, {max}]")]
    VolumeOutOfRange {
        symbol: Symbol,
        volume: Quantity,
        min: Quantity,
        max: Quantity,
    },
    #[error("{symbol}: volume {volume} not a multiple of lot size {lot_size}")]
    LotMismatch {
        symbol: Symbol,
        volume: Quantity,
        lot_size: Quantity,
    },
    #[error("{symbol}: price {price} below minimum {min_price}")]
    PriceTooLow {
        symbol: Symbol,
        price: Price,
        min_price: Price,
    },
    #[error("{symbol}: price {price} not a multiple of tick size {tick_size}")]
    TickMismatch {
        symbol: Symbol,
        price: Price,
        tick_size: Price,
    },
    #[error("{symbol}: notional {notional} outside [{min}, {max}]")]
    NotionalOutOfRange {
        symbol: Symbol,
        notional: Decimal,
        min: Decimal,
        max: Decimal,
    },
}

/// Immutable reference data for one tradable symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: Symbol,
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub contract_type: ContractType,
    pub tick_size: Price,
    pub lot_size: Quantity,
    pub min_quantity: Quantity,
    pub max_quantity: Quantity,
    pub min_notional: Decimal,
    pub max_notional: Decimal,
    pub min_price: Price,
    /// Quote value of one contract unit; 1 for spot and linear swaps.
    pub multiplier: Decimal,
}

impl Contract {
    /// A permissive spot contract, handy as a starting point for tests and
    /// sim setups.
    #[must_use]
    pub fn spot(symbol: &str, base: &str, quote: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: "sim".to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            contract_type: ContractType::Spot,
            tick_size: Decimal::new(1, 8),
            lot_size: Decimal::new(1, 8),
            min_quantity: Decimal::ZERO,
            max_quantity: Decimal::MAX,
            min_notional: Decimal::ZERO,
            max_notional: Decimal::MAX,
            min_price: Decimal::ZERO,
            multiplier: Decimal::ONE,
        }
    }

    /// Round a quantity down to the nearest lot multiple.
    #[must_use]
    pub fn round_lot(&self, qty: Quantity) -> Quantity {
        if self.lot_size.is_zero() {
            return qty;
        }
        (qty / self.lot_size).floor() * self.lot_size
    }

    /// Round a price down to the nearest tick multiple.
    #[must_use]
    pub fn round_tick(&self, price: Price) -> Price {
        if self.tick_size.is_zero() {
            return price;
        }
        (price / self.tick_size).floor() * self.tick_size
    }

    /// Validate an order against this contract's constraints before any
    /// network call. Market orders carry no price, so price and notional
    /// checks apply to limit orders only.
    pub fn validate(&self, order: &Order) -> Result<(), ContractError> {
        if order.volume < self.min_quantity || order.volume > self.max_quantity {
            return Err(ContractError::VolumeOutOfRange {
                symbol: self.symbol.clone(),
                volume: order.volume,
                min: self.min_quantity,
                max: self.max_quantity,
            });
        }
        if !self.lot_size.is_zero() && !(order.volume % self.lot_size).is_zero() {
            return Err(ContractError::LotMismatch {
                symbol: self.symbol.clone(),
                volume: order.volume,
                lot_size: self.lot_size,
            });
        }
        if order.order_type == OrderType::Market {
            return Ok(());
        }
        if order.price < self.min_price {
            return Err(ContractError::PriceTooLow {
                symbol: self.symbol.clone(),
                price: order.price,
                min_price: self.min_price,
            });
        }
        if !self.tick_size.is_zero() && !(order.price % self.tick_size).is_zero() {
            return Err(ContractError::TickMismatch {
                symbol: self.symbol.clone(),
                price: order.price,
                tick_size: self.tick_size,
            });
        }
        let notional = order.price * order.volume;
        if notional < self.min_notional || notional > self.max_notional {
            return Err(ContractError::NotionalOutOfRange {
                symbol: self.symbol.clone(),
                notional,
                min: self.min_notional,
                max: self.max_notional,
            });
        }
        Ok(())
    }
}

/// Explicit contract registry, built at startup and passed to the
/// components that need it.
#[derive(Debug, Default, Clone)]
pub struct ContractBook {
    contracts: HashMap<Symbol, Contract>,
}

impl ContractBook {
    #[must_use]
    pub fn new(contracts: impl IntoIterator<Item = Contract>) -> Self {
        Self {
            contracts: contracts
                .into_iter()
                .map(|c| (c.symbol.clone(), c))
                .collect(),
        }
    }

    #[must_use]
    pub fn shared(contracts: impl IntoIterator<Item = Contract>) -> Arc<Self> {
        Arc::new(Self::new(contracts))
    }

    pub fn insert(&mut self, contract: Contract) {
        self.contracts.insert(contract.symbol.clone(), contract);
    }

    pub fn get(&self, symbol: &str) -> Result<&Contract, ContractError> {
        self.contracts
            .get(symbol)
            .ok_or_else(|| ContractError::UnknownSymbol(symbol.to_string()))
    }

    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.contracts.contains_key(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values()
    }
}
