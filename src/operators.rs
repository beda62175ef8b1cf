//! Operator names derived from callsign prefixes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// ICAO airline designator (first three callsign characters) to operator name.
const AIRLINE_PREFIXES: &[(&str, &str)] = &[
    ("AAL", "American Airlines"),
    ("AAR", "Asiana"),
    ("AAY", "Allegiant Air"),
    ("AFR", "Air France"),
    ("ANA", "All Nippon Airways"),
    ("ANZ", "Air New Zealand"),
    ("ASH", "Mesa Airlines"),
    ("AVA", "Avianca"),
    ("AZA", "ITA Airways"),
    ("BAW", "British Airways"),
    ("BEE", "Flybe"),
    ("CAL", "China Airlines"),
    ("CCA", "Air China"),
    ("CES", "China Eastern"),
    ("CLX", "Cargolux"),
    ("CPA", "Cathay Pacific"),
    ("CPZ", "Compass Airlines"),
    ("CSN", "China Southern"),
    ("DAL", "Delta"),
    ("DLH", "Lufthansa"),
    ("ETD", "Etihad"),
    ("EVA", "EVA Air"),
    ("EXS", "Jet2"),
    ("EZY", "easyJet"),
    ("FDX", "FedEx"),
    ("FIN", "Finnair"),
    ("GLO", "Gol"),
    ("GTI", "Atlas Air"),
    ("GWI", "Germanwings"),
    ("HKG", "Hong Kong Airlines"),
    ("HYA", "Hainan Airlines"),
    ("IBE", "Iberia"),
    ("JAL", "Japan Airlines"),
    ("JBU", "JetBlue"),
    ("JST", "Jetstar"),
    ("KAL", "Korean Air"),
    ("KLM", "KLM"),
    ("LAN", "LATAM"),
    ("MTN", "Mountain Air"),
    ("NJS", "National Jet Systems"),
    ("NWK", "Network Aviation"),
    ("QFA", "Qantas"),
    ("QLK", "QantasLink"),
    ("QTR", "Qatar Airways"),
    ("QXE", "Horizon Air"),
    ("RXA", "Regional Express (Rex)"),
    ("RYK", "Ryanair"),
    ("RYR", "Ryanair"),
    ("SAS", "Scandinavian Airlines"),
    ("SHT", "British Airways"),
    ("SIA", "Singapore Airlines"),
    ("SKW", "SkyWest"),
    ("STN", "Ryanair"),
    ("SWA", "Southwest"),
    ("TAM", "LATAM"),
    ("THY", "Turkish Airlines"),
    ("TJS", "Jetstar Asia"),
    ("TNT", "FedEx"),
    ("TSR", "TransState"),
    ("TUI", "TUI Airways"),
    ("UAE", "Emirates"),
    ("UAL", "United"),
    ("UPS", "UPS"),
    ("VBH", "Virgin Australia"),
    ("VIR", "Virgin Atlantic"),
    ("VLG", "Vueling"),
    ("VOZ", "Virgin Australia"),
    ("WZZ", "Wizz Air"),
    ("XRO", "JetEx"),
];

const RELOAD_INTERVAL: Duration = Duration::from_secs(300);

/// Airline name for a callsign from the built-in table.
pub fn airline_for_callsign(callsign: &str) -> Option<&'static str> {
    let prefix = callsign_prefix(callsign)?;
    AIRLINE_PREFIXES
        .binary_search_by(|(p, _)| (*p).cmp(prefix.as_str()))
        .ok()
        .map(|i| AIRLINE_PREFIXES[i].1)
}

fn callsign_prefix(callsign: &str) -> Option<String> {
    let callsign = callsign.trim();
    if callsign.is_empty() || callsign.eq_ignore_ascii_case("N/A") {
        return None;
    }
    Some(callsign.chars().take(3).collect::<String>().to_ascii_uppercase())
}

/// Generic operator label for a registration country.
pub fn country_operators(country: &str) -> Option<String> {
    match country.trim() {
        "" => None,
        "Australia" => Some("Various Australian operators".to_string()),
        c => Some(format!("Various {} operators", c)),
    }
}

/// Whether an operator value is a generic "Various … operators" placeholder.
pub fn is_placeholder(operator: &str) -> bool {
    operator.contains("Various") && operator.contains("operators")
}

struct Overrides {
    table: HashMap<String, String>,
    loaded_at: Option<Instant>,
}

/// Callsign prefix lookup with an optional user-maintained override file.
///
/// The file is a JSON object of `{"PREFIX": "Operator"}` pairs and is
/// re-read at most every five minutes.
pub struct OperatorDirectory {
    overrides_path: Option<PathBuf>,
    overrides: Mutex<Overrides>,
}

impl OperatorDirectory {
    pub fn new(overrides_path: Option<PathBuf>) -> Self {
        Self {
            overrides_path,
            overrides: Mutex::new(Overrides {
                table: HashMap::new(),
                loaded_at: None,
            }),
        }
    }

    /// Built-in table only.
    pub fn builtin() -> Self {
        Self::new(None)
    }

    /// Operator for a callsign, preferring user overrides.
    pub fn lookup(&self, callsign: &str) -> Option<String> {
        let prefix = callsign_prefix(callsign)?;

        if self.overrides_path.is_some() {
            self.refresh_overrides();
            if let Some(name) = self.overrides.lock().table.get(&prefix) {
                return Some(name.clone());
            }
        }

        airline_for_callsign(&prefix).map(str::to_string)
    }

    fn refresh_overrides(&self) {
        let Some(path) = &self.overrides_path else {
            return;
        };

        let mut overrides = self.overrides.lock();
        if overrides
            .loaded_at
            .is_some_and(|at| at.elapsed() < RELOAD_INTERVAL)
        {
            return;
        }
        overrides.loaded_at = Some(Instant::now());

        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(table) => {
                    overrides.table = table
                        .into_iter()
                        .map(|(k, v)| (k.to_ascii_uppercase(), v))
                        .collect();
                    tracing::debug!("Loaded {} operator overrides", overrides.table.len());
                }
                Err(e) => tracing::warn!("Ignoring operator file {}: {}", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => overrides.table.clear(),
            Err(e) => tracing::warn!("Cannot read operator file {}: {}", path.display(), e),
        }
    }
}

impl Default for OperatorDirectory {
    fn default() -> Self {
        Self::builtin()
    }
}
