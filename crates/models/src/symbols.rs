use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use crate::error::{MarketStreamError, Result};
use crate::market::{PRICE_CEILING, PRICE_FLOOR};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolSpec {
    pub symbol: String,
    pub base_price: Decimal,
}

impl SymbolSpec {
    pub fn new(symbol: impl Into<String>, base_price: Decimal) -> Self {
        Self { symbol: symbol.into(), base_price }
    }
}

/// The fixed, ordered set of tradable symbols.
///
/// Built once at startup; nothing adds or removes symbols afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolUniverse {
    specs: Vec<SymbolSpec>,
}

impl SymbolUniverse {
    pub fn new(specs: Vec<SymbolSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(MarketStreamError::Config("symbol universe must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for spec in &specs {
            if spec.symbol.trim().is_empty() {
                return Err(MarketStreamError::Config("symbol must not be blank".to_string()));
            }
            if !seen.insert(spec.symbol.as_str()) {
                return Err(MarketStreamError::Config(format!("duplicate symbol: {}", spec.symbol)));
            }
            if spec.base_price < PRICE_FLOOR || spec.base_price > PRICE_CEILING {
                return Err(MarketStreamError::InvalidBasePrice {
                    symbol: spec.symbol.clone(),
                    price: spec.base_price.to_string(),
                });
            }
        }

        Ok(Self { specs })
    }

    pub fn default_specs() -> Vec<SymbolSpec> {
        vec![
            SymbolSpec::new("AAPL", dec!(150.00)),
            SymbolSpec::new("GOOGL", dec!(2800.00)),
            SymbolSpec::new("MSFT", dec!(300.00)),
            SymbolSpec::new("AMZN", dec!(3200.00)),
            SymbolSpec::new("TSLA", dec!(800.00)),
            SymbolSpec::new("META", dec!(250.00)),
            SymbolSpec::new("NVDA", dec!(450.00)),
            SymbolSpec::new("NFLX", dec!(400.00)),
            SymbolSpec::new("TATAINFY", dec!(25.00)),
            SymbolSpec::new("RELIANCE", dec!(2500.00)),
        ]
    }

    pub fn specs(&self) -> &[SymbolSpec] {
        &self.specs
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.symbol.as_str())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.specs.iter().any(|spec| spec.symbol == symbol)
    }

    pub fn base_price(&self, symbol: &str) -> Option<Decimal> {
        self.specs
            .iter()
            .find(|spec| spec.symbol == symbol)
            .map(|spec| spec.base_price)
    }

    /// Like [`contains`](Self::contains) but yields an error for unknown symbols.
    pub fn require(&self, symbol: &str) -> Result<&SymbolSpec> {
        self.specs
            .iter()
            .find(|spec| spec.symbol == symbol)
            .ok_or_else(|| MarketStreamError::UnknownSymbol { symbol: symbol.to_string() })
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for SymbolUniverse {
    fn default() -> Self {
        Self { specs: Self::default_specs() }
    }
}
