use chrono::{Local, NaiveDateTime, SubsecRound};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use crate::error::Result;

/// Decimal places carried by every price-like field.
pub const PRICE_SCALE: u32 = 2;

/// No generated price may fall below this value.
pub const PRICE_FLOOR: Decimal = dec!(1.00);

/// Largest accepted base price.
pub const PRICE_CEILING: Decimal = dec!(1000000000.00);

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One point-in-time market data record for a symbol.
///
/// Decimals travel as strings on the wire and the timestamp as
/// `yyyy-MM-dd HH:mm:ss`, so a snapshot survives the channel unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    pub volume: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub change: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub change_percent: Decimal,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
}

impl Snapshot {
    /// Flat snapshot at a base price: no spread, no change, minimum volume.
    pub fn baseline(symbol: impl Into<String>, base_price: Decimal, timestamp: NaiveDateTime) -> Self {
        Self {
            symbol: symbol.into(),
            price: base_price,
            bid_price: base_price,
            ask_price: base_price,
            volume: 1000,
            change: Decimal::ZERO,
            change_percent: Decimal::ZERO,
            timestamp,
        }
    }

    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }

    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Wall-clock time truncated to whole seconds, the resolution of the wire format.
pub fn wall_clock_now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S>(timestamp: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}
