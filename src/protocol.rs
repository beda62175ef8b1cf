//! Line parser for the BaseStation (SBS-1) text feed.
//!
//! A feed line looks like:
//!
//! ```text
//! MSG,3,1,1,AB1234,1,2024/05/01,12:00:00.000,2024/05/01,12:00:00.000,CALL123,35000,450,,52.1,-1.2,,,0,0,0,0
//! ```
//!
//! Only the columns needed for logging are extracted; values are kept as raw
//! tokens.

use crate::types::Observation;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Too few fields: need {need}, got {got}")]
    TooFewFields { need: usize, got: usize },
    #[error("Missing hex identifier")]
    MissingHex,
}

const HEX_FIELD: usize = 4;
const CALLSIGN_FIELD: usize = 10;
const ALTITUDE_FIELD: usize = 11;
const SPEED_FIELD: usize = 12;
const LATITUDE_FIELD: usize = 14;
const LONGITUDE_FIELD: usize = 15;

/// Fields required to reach the longitude column.
pub const MIN_FIELDS: usize = LONGITUDE_FIELD + 1;

/// Parse one feed line.
pub fn parse_message(line: &str) -> Result<Observation, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(',').collect();

    if fields.len() < MIN_FIELDS {
        return Err(ParseError::TooFewFields {
            need: MIN_FIELDS,
            got: fields.len(),
        });
    }

    let field = |idx: usize| -> String {
        fields
            .get(idx)
            .map(|f| f.trim().to_string())
            .unwrap_or_default()
    };

    let hex = field(HEX_FIELD).to_ascii_uppercase();
    if hex.is_empty() {
        return Err(ParseError::MissingHex);
    }

    Ok(Observation {
        hex,
        callsign: field(CALLSIGN_FIELD),
        altitude: field(ALTITUDE_FIELD),
        speed: field(SPEED_FIELD),
        latitude: field(LATITUDE_FIELD),
        longitude: field(LONGITUDE_FIELD),
    })
}

/// Parse one feed line, discarding the rejection reason.
pub fn parse(line: &str) -> Option<Observation> {
    match parse_message(line) {
        Ok(obs) => Some(obs),
        Err(e) => {
            tracing::debug!("Dropping feed line: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_with(values: &[(usize, &str)], len: usize) -> String {
        let mut parts = vec![""; len];
        for &(idx, v) in values {
            parts[idx] = v;
        }
        parts.join(",")
    }

    #[test]
    fn test_parse_valid_message() {
        let line = line_with(
            &[
                (0, "MSG"),
                (4, "AB1234"),
                (10, "CALL123"),
                (11, "35000"),
                (12, "450"),
                (14, "52.1"),
                (15, "-1.2"),
            ],
            22,
        );
        let obs = parse(&line).unwrap();
        assert_eq!(obs.hex, "AB1234");
        assert_eq!(obs.callsign, "CALL123");
        assert_eq!(obs.altitude, "35000");
        assert_eq!(obs.speed, "450");
        assert_eq!(obs.latitude, "52.1");
        assert_eq!(obs.longitude, "-1.2");
    }

    #[test]
    fn test_hex_is_trimmed_and_uppercased() {
        let line = line_with(&[(4, " ab12cd "), (10, "BAW1  ")], 16);
        let obs = parse_message(&format!("{line}\r\n")).unwrap();
        assert_eq!(obs.hex, "AB12CD");
        assert_eq!(obs.callsign, "BAW1");
        assert_eq!(obs.longitude, "");
    }

    #[test]
    fn test_short_lines_rejected() {
        assert_eq!(
            parse_message("too,short"),
            Err(ParseError::TooFewFields { need: 16, got: 2 })
        );
        assert!(parse(&line_with(&[(4, "AB1234")], 15)).is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn test_empty_hex_rejected() {
        let line = line_with(&[(4, "   "), (10, "CALL")], 22);
        assert_eq!(parse_message(&line), Err(ParseError::MissingHex));
    }

    #[test]
    fn test_every_long_line_with_hex_parses() {
        for len in MIN_FIELDS..30 {
            let line = line_with(&[(4, "4ca1b2")], len);
            assert_eq!(parse(&line).map(|o| o.hex), Some("4CA1B2".to_string()));
        }
    }
}
