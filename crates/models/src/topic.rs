use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use crate::error::MarketStreamError;
use crate::market::Snapshot;

pub const TOPIC_PREFIX: &str = "market-data";
const ALL_SUFFIX: &str = "all";

/// Broadcast destination: `market-data.all` or `market-data.<SYMBOL>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    All,
    Symbol(String),
}

impl Topic {
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self::Symbol(symbol.into())
    }

    /// Every snapshot fans out to its own symbol topic and to `all`.
    pub fn fan_out(snapshot: &Snapshot) -> [Topic; 2] {
        [Topic::Symbol(snapshot.symbol.clone()), Topic::All]
    }

    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        match self {
            Topic::All => true,
            Topic::Symbol(symbol) => *symbol == snapshot.symbol,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::All => write!(f, "{TOPIC_PREFIX}.{ALL_SUFFIX}"),
            Topic::Symbol(symbol) => write!(f, "{TOPIC_PREFIX}.{symbol}"),
        }
    }
}

impl FromStr for Topic {
    type Err = MarketStreamError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || MarketStreamError::InvalidTopic { topic: raw.to_string() };

        let suffix = raw
            .strip_prefix(TOPIC_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(invalid)?;

        match suffix {
            "" => Err(invalid()),
            ALL_SUFFIX => Ok(Topic::All),
            symbol => Ok(Topic::Symbol(symbol.to_string())),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = MarketStreamError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::wall_clock_now;
    use rust_decimal_macros::dec;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::All.to_string(), "market-data.all");
        assert_eq!(Topic::symbol("AAPL").to_string(), "market-data.AAPL");
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!("market-data.all".parse::<Topic>().unwrap(), Topic::All);
        assert_eq!("market-data.TSLA".parse::<Topic>().unwrap(), Topic::symbol("TSLA"));
        assert!("market-data.".parse::<Topic>().is_err());
        assert!("market-dataAAPL".parse::<Topic>().is_err());
        assert!("/topic/market-data/all".parse::<Topic>().is_err());
    }

    #[test]
    fn test_fan_out_targets_symbol_and_all() {
        let snapshot = Snapshot::baseline("MSFT", dec!(300.00), wall_clock_now());
        let [own, all] = Topic::fan_out(&snapshot);

        assert_eq!(own, Topic::symbol("MSFT"));
        assert_eq!(all, Topic::All);
        assert!(own.matches(&snapshot));
        assert!(!Topic::symbol("AAPL").matches(&snapshot));
    }
}
