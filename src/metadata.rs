//! Metadata sources and the JSON response shapes they return.
//!
//! Three shapes are understood:
//!
//! | Shape          | Example service       | Key             |
//! |----------------|-----------------------|-----------------|
//! | `AircraftList` | adsb.lol / readsb     | `"ac": [{..}]`  |
//! | `States`       | OpenSky `states/all`  | `"states": [[..]]` |
//! | `Flat`         | OpenSky metadata      | top-level object |
//!
//! Each shape is decoded into a [`SourceRecord`] and normalized into
//! [`Metadata`] by [`normalize`].

use crate::operators::{self, OperatorDirectory};
use crate::types::Metadata;
use serde::Deserialize;
use serde_json::Value;

pub const ADSBLOL_URL: &str = "https://api.adsb.lol/v2/icao/{hex}";
pub const OPENSKY_METADATA_URL: &str = "https://opensky-network.org/api/metadata/aircraft/icao/{hex}";

/// Default lookup order.
pub fn default_sources() -> Vec<MetadataSource> {
    vec![
        MetadataSource::new(ADSBLOL_URL),
        MetadataSource::new(OPENSKY_METADATA_URL),
    ]
}

/// One lookup URL template.
///
/// Placeholders: `{hex}` and `{hex_lower}` (lowercase), `{hex_upper}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSource {
    template: String,
}

impl MetadataSource {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn url_for(&self, hex: &str) -> String {
        let lower = hex.to_ascii_lowercase();
        self.template
            .replace("{hex_lower}", &lower)
            .replace("{hex_upper}", &hex.to_ascii_uppercase())
            .replace("{hex}", &lower)
    }
}

/// Entry of an adsb.lol style `ac` array.
#[derive(Debug, Default, Deserialize)]
pub struct AircraftEntry {
    #[serde(default, alias = "registration")]
    pub r: Option<String>,
    #[serde(default, alias = "type")]
    pub t: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub flight: Option<String>,
    #[serde(default, rename = "ownOp")]
    pub own_op: Option<String>,
}

/// OpenSky metadata style object.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatRecord {
    #[serde(default, alias = "reg")]
    pub registration: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub manufacturer_name: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub operator_callsign: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// A decoded response, one variant per known shape.
#[derive(Debug)]
pub enum MetadataResponse {
    AircraftList(Vec<AircraftEntry>),
    /// Rows of an OpenSky state vector array: icao24, callsign, origin country, ...
    States(Vec<Vec<Value>>),
    Flat(FlatRecord),
}

impl MetadataResponse {
    /// Recognize the shape of a JSON body. `None` if it is not a known shape.
    pub fn from_json(body: Value) -> Option<Self> {
        let Value::Object(mut map) = body else {
            return None;
        };

        if let Some(ac) = map.remove("ac") {
            return serde_json::from_value(ac).ok().map(Self::AircraftList);
        }
        if let Some(states) = map.remove("states") {
            // OpenSky returns `"states": null` when nothing matches.
            return match states {
                Value::Null => Some(Self::States(Vec::new())),
                other => serde_json::from_value(other).ok().map(Self::States),
            };
        }
        serde_json::from_value(Value::Object(map)).ok().map(Self::Flat)
    }

    /// Pull the raw fields relevant to `hex` out of the response.
    pub fn into_record(self, hex: &str) -> SourceRecord {
        match self {
            Self::AircraftList(entries) => entries
                .into_iter()
                .next()
                .map(|ac| {
                    let model = text(ac.t);
                    SourceRecord {
                        registration: text(ac.r),
                        model: if model.is_empty() { text(ac.desc) } else { model },
                        operator: text(ac.own_op),
                        callsign: text(ac.flight),
                        ..Default::default()
                    }
                })
                .unwrap_or_default(),
            Self::States(rows) => rows
                .into_iter()
                .find(|row| {
                    row.first()
                        .and_then(Value::as_str)
                        .is_some_and(|icao| icao.trim().eq_ignore_ascii_case(hex))
                })
                .map(|row| SourceRecord {
                    callsign: value_text(row.get(1)),
                    country: value_text(row.get(2)),
                    ..Default::default()
                })
                .unwrap_or_default(),
            Self::Flat(flat) => {
                let model = text(flat.model);
                SourceRecord {
                    registration: text(flat.registration),
                    model: if model.is_empty() {
                        text(flat.manufacturer_name)
                    } else {
                        model
                    },
                    operator: text(flat.operator),
                    owner: text(flat.owner),
                    callsign: text(flat.operator_callsign),
                    country: text(flat.country),
                }
            }
        }
    }
}

/// Raw, shape-independent fields of one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRecord {
    pub registration: String,
    pub model: String,
    pub operator: String,
    pub owner: String,
    pub callsign: String,
    pub country: String,
}

fn text(v: Option<String>) -> String {
    v.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn value_text(v: Option<&Value>) -> String {
    v.and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Turn a raw record into [`Metadata`], deriving the operator.
///
/// Operator precedence: structured operator field, callsign prefix table,
/// owner field, then a country-wide placeholder.
pub fn normalize(record: SourceRecord, directory: &OperatorDirectory) -> Metadata {
    let mut operator = record.operator;
    if operators::is_placeholder(&operator) {
        operator.clear();
    }
    if operator.is_empty() {
        operator = directory.lookup(&record.callsign).unwrap_or_default();
    }
    if operator.is_empty() {
        operator = record.owner;
    }
    if operator.is_empty() {
        operator = operators::country_operators(&record.country).unwrap_or_default();
    }

    Metadata {
        registration: record.registration,
        model: record.model,
        operator,
        callsign: record.callsign,
    }
}

/// Decode and normalize a body. `None` when the shape is unknown or nothing
/// useful came back.
pub fn extract(body: Value, hex: &str, directory: &OperatorDirectory) -> Option<Metadata> {
    let response = MetadataResponse::from_json(body)?;
    let meta = normalize(response.into_record(hex), directory);
    (!meta.is_empty()).then_some(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dir() -> OperatorDirectory {
        OperatorDirectory::builtin()
    }

    #[test]
    fn test_url_placeholders() {
        let src = MetadataSource::new("http://x/{hex}/{hex_upper}/{hex_lower}");
        assert_eq!(src.url_for("AB12cd"), "http://x/ab12cd/AB12CD/ab12cd");
    }

    #[test]
    fn test_flat_opensky_shape() {
        let body = json!({
            "registration": "N12345",
            "model": "Cessna 172",
            "manufacturerName": "Cessna",
            "operator": "Acme Air",
            "operatorCallsign": "ACME123",
            "icao24": "ab1234",
        });
        let meta = extract(body, "ab1234", &dir()).unwrap();
        assert_eq!(meta, Metadata::new("N12345", "Cessna 172", "Acme Air", "ACME123"));
    }

    #[test]
    fn test_flat_aliases_and_fallbacks() {
        let body = json!({"reg": "G-ABCD", "manufacturerName": "Piper", "owner": "Flying Club"});
        let meta = extract(body, "400001", &dir()).unwrap();
        assert_eq!(meta.registration, "G-ABCD");
        assert_eq!(meta.model, "Piper");
        assert_eq!(meta.operator, "Flying Club");
    }

    #[test]
    fn test_aircraft_list_shape() {
        let body = json!({"ac": [{"r": "VH-OQA", "t": "A388", "flight": "QFA1    "}], "total": 1});
        let meta = extract(body, "7c4ee8", &dir()).unwrap();
        assert_eq!(meta, Metadata::new("VH-OQA", "A388", "Qantas", "QFA1"));
    }

    #[test]
    fn test_empty_aircraft_list_is_unusable() {
        assert!(extract(json!({"ac": [], "total": 0}), "abcdef", &dir()).is_none());
    }

    #[test]
    fn test_states_shape_matches_hex() {
        let body = json!({
            "time": 1,
            "states": [
                ["aaaaaa", "DLH4  ", "Germany", 1.0],
                ["abcdef", "XYZ9  ", "Germany", 1.0],
            ]
        });
        let meta = extract(body, "ABCDEF", &dir()).unwrap();
        assert_eq!(meta.callsign, "XYZ9");
        assert_eq!(meta.operator, "Various Germany operators");
        assert!(extract(json!({"states": null}), "abcdef", &dir()).is_none());
    }

    #[test]
    fn test_operator_precedence() {
        let base = SourceRecord {
            operator: "Structured".into(),
            owner: "Owner Ltd".into(),
            callsign: "BAW12".into(),
            country: "Australia".into(),
            ..Default::default()
        };
        assert_eq!(normalize(base.clone(), &dir()).operator, "Structured");

        let placeholder = SourceRecord {
            operator: "Various United Kingdom operators".into(),
            ..base.clone()
        };
        assert_eq!(normalize(placeholder, &dir()).operator, "British Airways");

        let no_prefix = SourceRecord {
            operator: String::new(),
            callsign: "ZZZ1".into(),
            ..base.clone()
        };
        assert_eq!(normalize(no_prefix.clone(), &dir()).operator, "Owner Ltd");

        let only_country = SourceRecord {
            owner: String::new(),
            ..no_prefix
        };
        assert_eq!(
            normalize(only_country, &dir()).operator,
            "Various Australian operators"
        );
    }

    #[test]
    fn test_unknown_shapes_rejected() {
        assert!(MetadataResponse::from_json(json!([1, 2, 3])).is_none());
        assert!(MetadataResponse::from_json(json!("text")).is_none());
        assert!(extract(json!({"unrelated": true}), "abcdef", &dir()).is_none());
    }
}
