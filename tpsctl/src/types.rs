//! Common value types shared by the allocation pipeline.
//!
//! This module defines:
//! - Type aliases for identifiers ([`CarrierId`], [`AllocationId`])
//! - [`CountryCode`]: a validated, upper-cased destination country code
//! - [`PeakWindow`]: a half-open hour-of-day interval `[start, end)`
//! - TPS rounding helpers used wherever a solver figure becomes a committed quantity
//!
//! # TPS quantities
//!
//! Capacity and allocation figures are carried as [`Decimal`] so that the amount the
//! committer subtracts from a carrier is exactly the amount reported to the caller.
//! The solver works in `f64`; [`tps_from_f64`] is the single conversion point back.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type CarrierId = String;
pub type AllocationId = Uuid;

/// Decimal places kept on every allocated or committed TPS figure.
pub const TPS_DECIMAL_PLACES: u32 = 2;

/// Hours in a day; the exclusive upper bound of a [`PeakWindow`].
pub const HOURS_PER_DAY: u8 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("invalid country code {0:?}: expected 2-3 ASCII letters")]
    InvalidCountryCode(String),

    #[error("invalid peak window {0:?}: expected \"<start>-<end>\" with 0 <= start < end <= 24")]
    InvalidPeakWindow(String),
}

/// Round a TPS figure to [`TPS_DECIMAL_PLACES`], half to even.
pub fn round_tps(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(TPS_DECIMAL_PLACES, RoundingStrategy::MidpointNearestEven)
}

/// Truncate a capacity figure to [`TPS_DECIMAL_PLACES`]. Never rounds headroom up.
pub fn floor_tps(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(TPS_DECIMAL_PLACES, RoundingStrategy::ToZero)
}

/// Convert a solver output to a rounded TPS figure. Non-finite input yields `None`.
pub fn tps_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value).map(round_tps)
}

/// A destination country code such as `US` or `CA`.
///
/// Codes are normalised to upper case on construction; `"us"` and `"US"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

impl CountryCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CountryCode {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if !(2..=3).contains(&trimmed.len()) || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(TypeError::InvalidCountryCode(s.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for CountryCode {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CountryCode> for String {
    fn from(code: CountryCode) -> Self {
        code.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A half-open hour-of-day interval `[start, end)`.
///
/// Serialised as `"<start>-<end>"`, the same form requests use on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeakWindow {
    start: u8,
    end: u8,
}

impl PeakWindow {
    /// The whole day, `[0, 24)`. Used when a request omits its peak window.
    pub const FULL_DAY: PeakWindow = PeakWindow { start: 0, end: HOURS_PER_DAY };

    pub fn new(start: u8, end: u8) -> Result<Self, TypeError> {
        if start >= end || end > HOURS_PER_DAY {
            return Err(TypeError::InvalidPeakWindow(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    /// The band around a carrier's busiest hour `h`: `[max(0, h-4), min(23, h+3))`.
    ///
    /// The bounds are the start and end hours the profile export computes, read half-open, so
    /// an unclipped band spans seven hours: four before the peak hour and two after it. The
    /// end is raised to `h+1` when clipping would leave the peak hour itself outside, which
    /// only happens for `h = 23` (giving `[19, 24)` where the export's bounds give `[19, 23)`).
    pub fn around_peak_hour(hour: u8) -> Result<Self, TypeError> {
        if hour >= HOURS_PER_DAY {
            return Err(TypeError::InvalidPeakWindow(format!("peak hour {hour}")));
        }
        let end = (hour + 3).min(HOURS_PER_DAY - 1).max(hour + 1);
        Self::new(hour.saturating_sub(4), end)
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    /// Two windows overlap unless one ends at or before the other begins.
    pub fn overlaps(&self, other: &PeakWindow) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }
}

impl Default for PeakWindow {
    fn default() -> Self {
        Self::FULL_DAY
    }
}

impl FromStr for PeakWindow {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidPeakWindow(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u8>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u8>().map_err(|_| invalid())?;
        Self::new(start, end).map_err(|_| invalid())
    }
}

impl TryFrom<String> for PeakWindow {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeakWindow> for String {
    fn from(window: PeakWindow) -> Self {
        window.to_string()
    }
}

impl fmt::Display for PeakWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
