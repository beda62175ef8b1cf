//! Core data types shared by the ingestion pipeline.

use chrono::{DateTime, Utc};
use std::fmt;

/// Column names of the daily CSV log, in order.
pub const LOG_HEADER: [&str; 10] = [
    "Time UTC",
    "Hex",
    "Callsign",
    "Altitude",
    "Speed",
    "Latitude",
    "Longitude",
    "Registration",
    "Model",
    "Operator",
];

/// Timestamp layout used in the first CSV column.
pub const ROW_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One parsed feed line.
///
/// Fields are raw tokens from the feed; nothing is numerically validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// ICAO address, trimmed and uppercased. Never empty.
    pub hex: String,
    pub callsign: String,
    pub altitude: String,
    pub speed: String,
    pub latitude: String,
    pub longitude: String,
}

/// Aircraft metadata resolved from a lookup service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub registration: String,
    pub model: String,
    pub operator: String,
    pub callsign: String,
}

impl Metadata {
    pub fn new(
        registration: impl Into<String>,
        model: impl Into<String>,
        operator: impl Into<String>,
        callsign: impl Into<String>,
    ) -> Self {
        Self {
            registration: registration.into(),
            model: model.into(),
            operator: operator.into(),
            callsign: callsign.into(),
        }
    }

    /// True when no field carries a value.
    pub fn is_empty(&self) -> bool {
        self.registration.is_empty()
            && self.model.is_empty()
            && self.operator.is_empty()
            && self.callsign.is_empty()
    }

    /// True when registration, model and operator are all unknown.
    pub fn lacks_identity(&self) -> bool {
        self.registration.is_empty() && self.model.is_empty() && self.operator.is_empty()
    }

    /// Merge `other` into `self`, keeping existing values where `other` is blank.
    pub fn merge(&mut self, other: &Metadata) {
        merge_field(&mut self.registration, &other.registration);
        merge_field(&mut self.model, &other.model);
        merge_field(&mut self.operator, &other.operator);
        merge_field(&mut self.callsign, &other.callsign);
    }
}

/// Replace `slot` with `value` unless `value` is blank.
pub(crate) fn merge_field(slot: &mut String, value: &str) {
    if !value.is_empty() && slot.as_str() != value {
        slot.clear();
        slot.push_str(value);
    }
}

/// One persisted CSV row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub timestamp: DateTime<Utc>,
    pub hex: String,
    pub callsign: String,
    pub altitude: String,
    pub speed: String,
    pub latitude: String,
    pub longitude: String,
    pub registration: String,
    pub model: String,
    pub operator: String,
}

impl LogRow {
    /// Fields in header order, timestamp formatted.
    pub fn fields(&self) -> [String; 10] {
        [
            self.timestamp.format(ROW_TIME_FORMAT).to_string(),
            self.hex.clone(),
            self.callsign.clone(),
            self.altitude.clone(),
            self.speed.clone(),
            self.latitude.clone(),
            self.longitude.clone(),
            self.registration.clone(),
            self.model.clone(),
            self.operator.clone(),
        ]
    }

    /// Render as one CSV line without the trailing newline.
    pub fn to_csv_line(&self) -> String {
        csv_line(self.fields().iter().map(String::as_str))
    }
}

impl fmt::Display for LogRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv_line())
    }
}

/// Join fields with commas, quoting the ones that need it.
pub fn csv_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out
}

/// Split one CSV line, honouring double-quoted fields.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if current.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
