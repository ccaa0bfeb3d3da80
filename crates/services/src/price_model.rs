//! Bounded random walk that turns a previous price into the next snapshot.
//!
//! Every draw lands on an integer grid and is scaled into an exact decimal,
//! so no binary floating point ever touches a price.

use std::ops::RangeInclusive;

use chrono::NaiveDateTime;
use marketstream_models::{wall_clock_now, Snapshot, PRICE_FLOOR, PRICE_SCALE};
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Price moves are drawn from `[-5%, +5%]` in steps of 0.00001%.
const MOVE_STEPS: RangeInclusive<i64> = -500_000..=500_000;
const MOVE_SCALE: u32 = 7;

/// Spread is drawn from `[0.1%, 0.5%]` of the new price.
const SPREAD_STEPS: RangeInclusive<i64> = 1_000..=5_000;
const SPREAD_SCALE: u32 = 6;

pub const VOLUME_RANGE: RangeInclusive<u64> = 1000..=9999;

/// The random inputs of one step, separated out so the arithmetic can be
/// checked with chosen values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceMove {
    /// Fractional change applied to the previous price.
    pub delta: Decimal,
    /// Full bid/ask spread as a fraction of the new price.
    pub spread: Decimal,
    pub volume: u64,
}

impl PriceMove {
    pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            delta: Decimal::new(rng.gen_range(MOVE_STEPS), MOVE_SCALE),
            spread: Decimal::new(rng.gen_range(SPREAD_STEPS), SPREAD_SCALE),
            volume: rng.gen_range(VOLUME_RANGE),
        }
    }
}

pub fn advance<R: Rng + ?Sized>(rng: &mut R, symbol: &str, previous: Decimal) -> Snapshot {
    apply(symbol, previous, &PriceMove::draw(rng), wall_clock_now())
}

/// Applies a drawn move to `previous`.
///
/// `change` and `change_percent` describe the move before the price floor is
/// enforced. Near the floor the reported change can therefore disagree with
/// `price - previous`.
pub fn apply(symbol: &str, previous: Decimal, step: &PriceMove, timestamp: NaiveDateTime) -> Snapshot {
    // Saturating so a walk that compounds past Decimal::MAX pins there
    let unfloored = round_price(previous.saturating_add(previous.saturating_mul(step.delta)));
    let change = unfloored.saturating_sub(previous);
    let change_percent = change
        .checked_div(previous)
        .map_or(Decimal::ZERO, |ratio| round_price(ratio * dec!(100)));

    let price = unfloored.max(PRICE_FLOOR);
    let half_spread = round_price(price.saturating_mul(step.spread) / dec!(2));

    Snapshot {
        symbol: symbol.to_string(),
        price,
        bid_price: price.saturating_sub(half_spread),
        ask_price: price.saturating_add(half_spread),
        volume: step.volume,
        change,
        change_percent,
        timestamp,
    }
}

/// Rounds half away from zero to exactly two decimal places.
pub fn round_price(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(PRICE_SCALE);
    rounded
}
