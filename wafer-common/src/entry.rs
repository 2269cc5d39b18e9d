//! Lenient read model for persisted snapshot records
//!
//! Snapshot files may come from older runs or be caught mid-write, so every
//! field is optional here. Aggregation code matches on these options instead
//! of assuming a well-formed [`WaferRecord`](crate::WaferRecord).

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::record::{QualityStatus, UNKNOWN_CLASS};

/// One record loaded from disk
///
/// Serializes as the original JSON object, so API consumers see exactly
/// what was persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEntry {
    pub wafer_id: Option<String>,
    pub machine_id: Option<String>,
    pub machine_type: Option<String>,
    pub simulation_date: Option<String>,
    /// Calendar date of the record's `timestamp`, as written
    pub timestamp_date: Option<NaiveDate>,
    pub defect_percentage: Option<f64>,
    pub defect_class: Option<String>,
    pub confidence: Option<f64>,
    pub quality_status: Option<QualityStatus>,
    raw: Value,
}

impl ResultEntry {
    /// Parse a JSON value; non-objects are rejected
    pub fn from_value(value: Value) -> Option<Self> {
        let object = value.as_object()?;

        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
        let number = |v: Option<&Value>| v.and_then(Value::as_f64).filter(|n| n.is_finite());

        let prediction = object.get("prediction").and_then(Value::as_object);
        let prediction_field = |keys: [&str; 2]| {
            prediction.and_then(|p| keys.iter().find_map(|key| p.get(*key)))
        };

        // Top-level percentage wins; older layouts nest it under `defect_count`
        let defect_percentage = number(object.get("defect_percentage")).or_else(|| {
            number(
                object
                    .get("defect_count")
                    .and_then(|count| count.get("defect_percentage")),
            )
        });

        let quality_status = match object.get("quality_status").and_then(Value::as_str) {
            Some("PASS") => Some(QualityStatus::Pass),
            Some("FAIL") => Some(QualityStatus::Fail),
            _ => None,
        };

        let timestamp_date = object
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp_date);

        let wafer_id = text("wafer_id");
        let machine_id = text("machine_id");
        let machine_type = text("machine_type");
        let simulation_date = text("simulation_date").filter(|d| !d.is_empty());
        let defect_class = prediction_field(["defect_class", "Defect Class"])
            .and_then(Value::as_str)
            .map(str::to_string);
        let confidence = number(prediction_field(["confidence", "Confidence Score"]));

        Some(Self {
            wafer_id,
            machine_id,
            machine_type,
            simulation_date,
            timestamp_date,
            defect_percentage,
            defect_class,
            confidence,
            quality_status,
            raw: value,
        })
    }

    /// True only for an explicit PASS; a missing status counts as not passing
    pub fn is_pass(&self) -> bool {
        self.quality_status == Some(QualityStatus::Pass)
    }

    /// Defect class with the `Unknown` default applied
    pub fn defect_class_or_unknown(&self) -> &str {
        self.defect_class.as_deref().unwrap_or(UNKNOWN_CLASS)
    }

    /// `{machine_type}_{machine_id}` with `Unknown` defaults
    pub fn machine_key(&self) -> String {
        format!(
            "{}_{}",
            self.machine_type.as_deref().unwrap_or(UNKNOWN_CLASS),
            self.machine_id.as_deref().unwrap_or(UNKNOWN_CLASS)
        )
    }
}

impl Serialize for ResultEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

/// Accepts RFC 3339 (current writer) and naive ISO-8601 (older files)
fn parse_timestamp_date(timestamp: &str) -> Option<NaiveDate> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return Some(parsed.date_naive());
    }
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|parsed| parsed.date())
        .ok()
}
