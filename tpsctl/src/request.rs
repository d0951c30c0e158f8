//! Allocation request schema and boundary validation.
//!
//! Requests arrive from the front-end as loosely typed JSON. [`AllocationRequest::from_value`]
//! is the only way such a payload enters the pipeline: it either produces a fully validated
//! request or a [`ValidationError`], which the engine reports as `MalformedRequest` before any
//! carrier is looked at.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{CountryCode, PeakWindow, TPS_DECIMAL_PLACES};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Fields carried alongside a request that the solver never looks at.
///
/// They are passed through unchanged to the audit record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_tps: Option<Decimal>,
    /// Any other fields present on the payload
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A validated request for TPS capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    /// Positive, with at most [`TPS_DECIMAL_PLACES`] decimal places
    pub requested_tps: Decimal,
    /// Non-empty, de-duplicated, in the order first given
    pub destinations: Vec<CountryCode>,
    pub peak_window: PeakWindow,
    pub metadata: RequestMetadata,
}

impl AllocationRequest {
    pub fn new(
        requested_tps: Decimal,
        destinations: impl IntoIterator<Item = CountryCode>,
        peak_window: PeakWindow,
    ) -> Result<Self, ValidationError> {
        if requested_tps <= Decimal::ZERO {
            return Err(ValidationError::invalid("requested_tps", "must be a positive number"));
        }
        // Committed shares carry two decimal places
        if requested_tps.normalize().scale() > TPS_DECIMAL_PLACES {
            return Err(ValidationError::invalid(
                "requested_tps",
                format!("{requested_tps} has more than {TPS_DECIMAL_PLACES} decimal places"),
            ));
        }

        let mut unique: Vec<CountryCode> = Vec::new();
        for destination in destinations {
            if !unique.contains(&destination) {
                unique.push(destination);
            }
        }
        if unique.is_empty() {
            return Err(ValidationError::invalid("destinations", "must contain at least one country code"));
        }

        Ok(Self {
            requested_tps,
            destinations: unique,
            peak_window,
            metadata: RequestMetadata::default(),
        })
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate a raw JSON payload.
    ///
    /// `requested_tps` must be a positive number with at most two decimal places,
    /// `destinations` a non-empty array of country codes, and `peak_window`, when present, a
    /// `"<start>-<end>"` string. A missing or null `peak_window` means the whole day.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut fields) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let requested_tps = match fields.remove("requested_tps") {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("requested_tps")),
            Some(Value::Number(n)) => {
                // Parsed from the JSON text to keep the exact decimal
                let text = n.to_string();
                text.parse::<Decimal>()
                    .or_else(|_| Decimal::from_scientific(&text))
                    .map_err(|_| ValidationError::invalid("requested_tps", format!("{n} is not representable")))?
            }
            Some(other) => {
                return Err(ValidationError::invalid("requested_tps", format!("expected a number, got {other}")));
            }
        };

        let destinations = match fields.remove("destinations") {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("destinations")),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s.parse::<CountryCode>().map_err(|e| ValidationError::invalid("destinations", e.to_string())),
                    other => Err(ValidationError::invalid("destinations", format!("expected a string, got {other}"))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(ValidationError::invalid("destinations", format!("expected an array, got {other}")));
            }
        };

        let peak_window = match fields.remove("peak_window") {
            None | Some(Value::Null) => PeakWindow::FULL_DAY,
            Some(Value::String(s)) => s.parse().map_err(|e: crate::types::TypeError| ValidationError::invalid("peak_window", e.to_string()))?,
            Some(other) => {
                return Err(ValidationError::invalid("peak_window", format!("expected a string, got {other}")));
            }
        };

        let metadata: RequestMetadata =
            serde_json::from_value(Value::Object(fields)).map_err(|e| ValidationError::invalid("metadata", e.to_string()))?;

        Ok(Self::new(requested_tps, destinations, peak_window)?.with_metadata(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parses_full_payload() {
        let request = AllocationRequest::from_value(json!({
            "requested_tps": 50,
            "destinations": ["US", "ca", "US"],
            "peak_window": "10-12",
            "traffic_volume": 100000,
            "peak_tps": 300,
            "requester_id": "cust-42",
            "channel": "sms"
        }))
        .unwrap();

        assert_eq!(request.requested_tps, dec!(50));
        assert_eq!(request.destinations.len(), 2);
        assert_eq!(request.destinations[1].as_str(), "CA");
        assert_eq!(request.peak_window, PeakWindow::new(10, 12).unwrap());
        assert_eq!(request.metadata.requester_id.as_deref(), Some("cust-42"));
        assert_eq!(request.metadata.traffic_volume, Some(100000));
        assert_eq!(request.metadata.peak_tps, Some(dec!(300)));
        assert_eq!(request.metadata.extra.get("channel"), Some(&json!("sms")));
    }

    #[test]
    fn test_missing_peak_window_defaults_to_full_day() {
        let request = AllocationRequest::from_value(json!({
            "requested_tps": 12.5,
            "destinations": ["US"]
        }))
        .unwrap();

        assert_eq!(request.peak_window, PeakWindow::FULL_DAY);
        assert_eq!(request.requested_tps, dec!(12.5));
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        let cases = [
            json!([1, 2, 3]),
            json!({"destinations": ["US"]}),
            json!({"requested_tps": "50", "destinations": ["US"]}),
            json!({"requested_tps": 0, "destinations": ["US"]}),
            json!({"requested_tps": -5, "destinations": ["US"]}),
            json!({"requested_tps": 10}),
            json!({"requested_tps": 10, "destinations": []}),
            json!({"requested_tps": 10, "destinations": "US"}),
            json!({"requested_tps": 10, "destinations": [1]}),
            json!({"requested_tps": 10, "destinations": ["United States"]}),
            json!({"requested_tps": 10, "destinations": ["US"], "peak_window": "14-12"}),
            json!({"requested_tps": 10, "destinations": ["US"], "peak_window": 9}),
            json!({"requested_tps": 10, "destinations": ["US"], "traffic_volume": "lots"}),
        ];

        for case in cases {
            assert!(AllocationRequest::from_value(case.clone()).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn test_sub_cent_volumes_are_rejected_not_rounded() {
        for tps in [json!(12.345), json!(0.001), json!(0.004)] {
            let err = AllocationRequest::from_value(json!({"requested_tps": tps, "destinations": ["US"]})).unwrap_err();
            assert!(
                matches!(&err, ValidationError::InvalidField { field: "requested_tps", reason } if reason.contains("decimal places")),
                "{err}"
            );
        }

        let request = AllocationRequest::from_value(json!({"requested_tps": 19.99, "destinations": ["US"]})).unwrap();
        assert_eq!(request.requested_tps, dec!(19.99));

        // Trailing zeros are not extra precision
        let request = AllocationRequest::new(dec!(12.500), ["US".parse().unwrap()], PeakWindow::FULL_DAY).unwrap();
        assert_eq!(request.requested_tps, dec!(12.5));
    }

    #[test]
    fn test_missing_field_is_reported_by_name() {
        let err = AllocationRequest::from_value(json!({"requested_tps": 10})).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("destinations"));
        assert_eq!(err.to_string(), "missing required field `destinations`");
    }
}
