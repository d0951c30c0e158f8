//! Carrier capacity records and the profile figures they are derived from.
//!
//! A [`CarrierCapacityRecord`] is the long-lived row the engine reads and the committer mutates.
//! Records are produced by the periodic refresh job from [`CarrierProfileRow`]s; rows that lack
//! finished headroom or peak bounds are derived from their usage columns.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{CarrierId, CountryCode, PeakWindow, TypeError, floor_tps};

/// Current capacity state of a single carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierCapacityRecord {
    pub carrier_id: CarrierId,
    /// Contractual TPS ceiling
    pub allowed_tps: Decimal,
    /// Observed usage. May transiently exceed `allowed_tps` due to measurement lag.
    pub consumed_tps: Decimal,
    /// Headroom offerable to new allocations. Never negative.
    pub allocatable_tps: Decimal,
    /// The carrier's actual traffic peak
    pub peak_window: PeakWindow,
    pub supported_countries: BTreeSet<CountryCode>,
}

impl CarrierCapacityRecord {
    pub fn supports(&self, destination: &CountryCode) -> bool {
        self.supported_countries.contains(destination)
    }

    /// True if the carrier serves at least one of `destinations`.
    pub fn supports_any(&self, destinations: &[CountryCode]) -> bool {
        destinations.iter().any(|d| self.supports(d))
    }

    pub fn has_headroom(&self) -> bool {
        self.allocatable_tps > Decimal::ZERO
    }
}

/// Load band of a carrier relative to its contractual ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UtilizationLevel {
    LowUtilization,
    MediumUtilization,
    HighUtilization,
    OverCapacity,
}

impl UtilizationLevel {
    /// Classify `(consumed + already_allocated) / allowed` into a band.
    pub fn classify(allowed_tps: Decimal, consumed_tps: Decimal, allocated_tps: Decimal) -> Self {
        let load = consumed_tps + allocated_tps;
        let over = |fraction: Decimal| load > allowed_tps * fraction;

        if over(Decimal::new(9, 1)) {
            UtilizationLevel::OverCapacity
        } else if over(Decimal::new(7, 1)) {
            UtilizationLevel::HighUtilization
        } else if over(Decimal::new(3, 1)) {
            UtilizationLevel::MediumUtilization
        } else {
            UtilizationLevel::LowUtilization
        }
    }
}

/// Whole-TPS headroom: `floor(max(0, allowed - consumed - already_allocated))`.
pub fn derive_allocatable(allowed_tps: Decimal, consumed_tps: Decimal, allocated_tps: Decimal) -> Decimal {
    (allowed_tps - consumed_tps - allocated_tps).max(Decimal::ZERO).floor()
}

/// Read a capacity figure from a loosely typed source.
///
/// Numbers and numeric strings are accepted. Anything else (null, garbage strings, negative
/// values, non-finite floats) reads as zero rather than failing the whole load.
pub fn lenient_tps(carrier_id: &str, field: &str, value: Option<&serde_json::Value>) -> Decimal {
    let parsed = match value {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(Decimal::from)
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        Some(serde_json::Value::String(s)) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    };

    match parsed {
        Some(tps) if tps >= Decimal::ZERO => tps,
        _ => {
            warn!(carrier = %carrier_id, field, value = ?value, "Unreadable capacity value, treating as zero");
            Decimal::ZERO
        }
    }
}

/// A carrier profile row as emitted by the analytics job.
///
/// Capacity columns are kept loosely typed on purpose: they are validated by [`lenient_tps`]
/// when the row becomes a [`CarrierCapacityRecord`]. When `allocatable_tps` is absent it is
/// derived from the usage columns; when the peak bounds are absent they are derived from
/// `actual_peak_hour`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CarrierProfileRow {
    #[serde(alias = "carrier_id")]
    pub carrier_name: String,
    #[serde(default)]
    pub allowed_tps: Option<serde_json::Value>,
    #[serde(default)]
    pub avg_tps_actual: Option<serde_json::Value>,
    #[serde(default)]
    pub allocatable_tps: Option<serde_json::Value>,
    #[serde(default)]
    pub total_allocated_tps: Option<serde_json::Value>,
    #[serde(default)]
    pub actual_peak_start_time: Option<u8>,
    #[serde(default)]
    pub actual_peak_end_time: Option<u8>,
    #[serde(default)]
    pub actual_peak_hour: Option<u8>,
    #[serde(default, alias = "supported_countries")]
    pub supported_countries_list: Vec<String>,
}

impl CarrierProfileRow {
    pub fn into_record(self) -> Result<CarrierCapacityRecord, TypeError> {
        let id = self.carrier_name.as_str();
        let allowed_tps = lenient_tps(id, "allowed_tps", self.allowed_tps.as_ref());
        let consumed_tps = lenient_tps(id, "avg_tps_actual", self.avg_tps_actual.as_ref());

        let allocatable_tps = match &self.allocatable_tps {
            Some(value) => lenient_tps(id, "allocatable_tps", Some(value)),
            None => {
                let allocated = match &self.total_allocated_tps {
                    Some(value) => lenient_tps(id, "total_allocated_tps", Some(value)),
                    None => Decimal::ZERO,
                };
                derive_allocatable(allowed_tps, consumed_tps, allocated)
            }
        };

        let peak_window = match (self.actual_peak_start_time, self.actual_peak_end_time, self.actual_peak_hour) {
            (Some(start), Some(end), _) => PeakWindow::new(start, end)?,
            (_, _, Some(hour)) => PeakWindow::around_peak_hour(hour)?,
            _ => PeakWindow::FULL_DAY,
        };

        let supported_countries = self
            .supported_countries_list
            .iter()
            .filter_map(|raw| match raw.parse::<CountryCode>() {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(carrier = %id, "Skipping supported country: {}", e);
                    None
                }
            })
            .collect();

        Ok(CarrierCapacityRecord {
            carrier_id: self.carrier_name,
            allowed_tps,
            consumed_tps,
            allocatable_tps: floor_tps(allocatable_tps),
            peak_window,
            supported_countries,
        })
    }
}
