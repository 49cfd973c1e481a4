// Record normalization: turns whatever a loyalty-program fetcher hands back
// into a canonical FlightAvailability, or says why it can't.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use rust_decimal::{prelude::FromPrimitive, Decimal};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::model::{is_airport_code, CabinClass, FlightAvailability};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid airport code in {field}: {value:?}")]
    InvalidAirport { field: &'static str, value: String },

    #[error("origin and destination are both {0}")]
    SameEndpoints(String),

    #[error("stops ({stops}) disagrees with {airports} connection airports")]
    StopsMismatch { stops: u32, airports: usize },

    #[error("unmappable cabin class: {0:?}")]
    UnknownCabin(String),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub default_ttl: Duration,
    pub program_ttls: HashMap<String, Duration>,
    // Used when a payload's cabin is missing or unmappable. None rejects.
    pub fallback_cabin: Option<CabinClass>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(6 * 60 * 60),
            program_ttls: HashMap::new(),
            fallback_cabin: None,
        }
    }
}

// Keys each field may arrive under, in lookup order. The first key present
// with a non-null value wins.
const ORIGIN_KEYS: &[&str] = &["origin", "from", "origin_code", "departure_airport"];
const DESTINATION_KEYS: &[&str] = &["destination", "to", "destination_code", "arrival_airport"];
const AIRLINE_KEYS: &[&str] = &["airline", "carrier", "operating_airline", "airline_name"];
const FLIGHT_NUMBER_KEYS: &[&str] = &["flight_number", "flight", "flight_no"];
const DATE_KEYS: &[&str] = &["departure_date", "date", "departure"];
const DEPARTURE_TIME_KEYS: &[&str] = &["departure_time", "depart_time", "dep_time"];
const ARRIVAL_TIME_KEYS: &[&str] = &["arrival_time", "arrive_time", "arr_time"];
const DURATION_KEYS: &[&str] = &["duration_minutes", "duration", "flight_time"];
const CABIN_KEYS: &[&str] = &["cabin_class", "cabin", "cabin_type", "fare_class"];
const POINTS_KEYS: &[&str] = &["points_required", "points", "miles", "award_cost"];
const TAXES_KEYS: &[&str] = &["taxes_fees", "taxes", "fees", "cash"];
const SEATS_KEYS: &[&str] = &["seats_available", "seats", "seats_left", "remaining_seats"];
const STOPS_KEYS: &[&str] = &["stops", "num_stops"];
const CONNECTION_KEYS: &[&str] = &["connection_airports", "connections", "via", "layovers"];

struct RawFlight<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> RawFlight<'a> {
    fn pick(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .find(|value| !value.is_null())
    }

    // Required text fields: absent is MissingField, any non-string is malformed.
    fn required_text(
        &self,
        field: &'static str,
        keys: &[&str],
    ) -> Result<&'a str, NormalizationError> {
        match self.pick(keys) {
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(other) => Err(NormalizationError::Malformed(format!(
                "{field} must be a string, got {other}"
            ))),
            None => Err(NormalizationError::MissingField(field)),
        }
    }

    // Optional text fields degrade to None on any other JSON type.
    fn optional_text(&self, keys: &[&str]) -> Option<&'a str> {
        self.pick(keys).and_then(Value::as_str)
    }
}

static HOURS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*h").expect("valid hours regex"));
static MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*m").expect("valid minutes regex"));
static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2}):(\d{2})(?::\d{2})?\s*([AaPp][Mm])?$").expect("valid clock regex")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("valid number regex"));
static POINTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d[\d,]*(?:\.\d+)?)\s*([kK]\b)?").expect("valid points regex")
});
static FLIGHT_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z0-9]{2})\d+").expect("valid flight regex"));

// Carrier code to display name, for payloads that only carry the code.
const AIRLINE_NAMES: &[(&str, &str)] = &[
    ("UA", "United Airlines"),
    ("AC", "Air Canada"),
    ("AA", "American Airlines"),
    ("DL", "Delta Air Lines"),
    ("LH", "Lufthansa"),
    ("BA", "British Airways"),
    ("EK", "Emirates"),
    ("SQ", "Singapore Airlines"),
    ("NH", "ANA"),
    ("TK", "Turkish Airlines"),
    ("LX", "Swiss"),
    ("OS", "Austrian"),
    ("TP", "TAP Portugal"),
    ("ET", "Ethiopian"),
    ("QF", "Qantas"),
    ("QR", "Qatar Airways"),
    ("CA", "Air China"),
    ("OZ", "Asiana"),
    ("BR", "EVA Air"),
    ("B6", "JetBlue"),
    ("VS", "Virgin Atlantic"),
];

const CABIN_ALIASES: &[(&str, CabinClass)] = &[
    ("y", CabinClass::Economy),
    ("economy", CabinClass::Economy),
    ("eco", CabinClass::Economy),
    ("coach", CabinClass::Economy),
    ("main cabin", CabinClass::Economy),
    ("basic", CabinClass::Economy),
    ("w", CabinClass::PremiumEconomy),
    ("premium_economy", CabinClass::PremiumEconomy),
    ("premium economy", CabinClass::PremiumEconomy),
    ("premium eco", CabinClass::PremiumEconomy),
    ("premium", CabinClass::PremiumEconomy),
    ("economy plus", CabinClass::PremiumEconomy),
    ("j", CabinClass::Business),
    ("c", CabinClass::Business),
    ("biz", CabinClass::Business),
    ("business", CabinClass::Business),
    ("business class", CabinClass::Business),
    ("polaris", CabinClass::Business),
    ("signature", CabinClass::Business),
    ("club", CabinClass::Business),
    ("upper class", CabinClass::Business),
    ("mint", CabinClass::Business),
    ("f", CabinClass::First),
    ("first", CabinClass::First),
    ("first class", CabinClass::First),
    ("global first", CabinClass::First),
    ("suites", CabinClass::First),
];

// Substring fallback; earlier entries win, so "premium economy" never lands
// on economy and "first class suite" never lands on business.
const CABIN_KEYWORDS: &[(&str, CabinClass)] = &[
    ("first", CabinClass::First),
    ("suite", CabinClass::First),
    ("business", CabinClass::Business),
    ("polaris", CabinClass::Business),
    ("upper", CabinClass::Business),
    ("premium", CabinClass::PremiumEconomy),
    ("plus", CabinClass::PremiumEconomy),
    ("economy", CabinClass::Economy),
    ("coach", CabinClass::Economy),
];

pub fn map_cabin_class(value: &str) -> Option<CabinClass> {
    let normalized = value.trim().to_ascii_lowercase().replace('-', " ");
    if normalized.is_empty() {
        return None;
    }

    if let Some((_, cabin)) = CABIN_ALIASES.iter().find(|(alias, _)| *alias == normalized) {
        return Some(*cabin);
    }

    CABIN_KEYWORDS
        .iter()
        .find(|(keyword, _)| normalized.contains(keyword))
        .map(|(_, cabin)| *cabin)
}

pub fn parse_duration_minutes(value: &str) -> Option<u32> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(minutes) = value.parse::<u32>() {
        return Some(minutes);
    }

    if let Some(caps) = CLOCK_RE.captures(value) {
        if caps.get(3).is_none() {
            let hours: u32 = caps[1].parse().ok()?;
            let minutes: u32 = caps[2].parse().ok()?;
            return hours.checked_mul(60)?.checked_add(minutes);
        }
    }

    // "PT5H30M" has a leading 'T' that neither regex cares about.
    let hours = HOURS_RE
        .captures(value)
        .and_then(|c| c[1].parse::<u32>().ok());
    let minutes = MINUTES_RE
        .captures(value)
        .and_then(|c| c[1].parse::<u32>().ok());

    match (hours, minutes) {
        (None, None) => None,
        (h, m) => h.unwrap_or(0).checked_mul(60)?.checked_add(m.unwrap_or(0)),
    }
}

pub fn parse_clock_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.time());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local().time());
    }

    let caps = CLOCK_RE.captures(value)?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;

    if let Some(period) = caps.get(3) {
        if hour == 0 || hour > 12 {
            return None;
        }
        let pm = period.as_str().eq_ignore_ascii_case("pm");
        hour = match (pm, hour) {
            (true, 12) => 12,
            (true, h) => h + 12,
            (false, 12) => 0,
            (false, h) => h,
        };
    }

    NaiveTime::from_hms_opt(hour, minute, 0)
}

pub fn parse_departure_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%m/%d/%Y"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .map(|dt| dt.date())
                .ok()
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.date_naive())
                .ok()
        })
}

// First numeric run only: "85,000 miles + $5.60" is 85000 points.
pub fn parse_points(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    if trimmed.starts_with('-') {
        return None;
    }

    let caps = POINTS_RE.captures(trimmed)?;
    let number = caps[1].replace(',', "").parse::<f64>().ok()?;
    let points = if caps.get(2).is_some() { number * 1000.0 } else { number };

    if points.is_finite() && points >= 0.0 && points <= f64::from(u32::MAX) {
        Some(points as u32)
    } else {
        None
    }
}

pub fn parse_money(value: &str) -> Option<Decimal> {
    let trimmed = value.trim();
    if trimmed.starts_with('-') {
        return None;
    }
    let run = NUMBER_RE.find(trimmed)?;
    Decimal::from_str(&run.as_str().replace(',', "")).ok()
}

// Counts arrive as integers, floats or digit strings. Anything else is None.
fn coerce_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(u32::try_from).and_then(Result::ok).or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && *f <= f64::from(u32::MAX))
                .map(|f| f as u32)
        }),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

fn normalize_airport(field: &'static str, value: &str) -> Result<String, NormalizationError> {
    let code = value.trim().to_ascii_uppercase();
    if is_airport_code(&code) {
        Ok(code)
    } else {
        Err(NormalizationError::InvalidAirport {
            field,
            value: value.to_string(),
        })
    }
}

fn airline_for_code(code: &str) -> Option<&'static str> {
    AIRLINE_NAMES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
}

fn display_airline(airline: Option<&str>, flight_number: &str) -> String {
    match airline.map(str::trim).filter(|a| !a.is_empty()) {
        Some(a) if a.len() == 2 => airline_for_code(a)
            .map(str::to_string)
            .unwrap_or_else(|| a.to_ascii_uppercase()),
        Some(a) => a.to_string(),
        None => FLIGHT_PREFIX_RE
            .captures(flight_number)
            .map(|c| {
                airline_for_code(&c[1])
                    .map(str::to_string)
                    .unwrap_or_else(|| c[1].to_string())
            })
            .unwrap_or_else(|| "Unknown".to_string()),
    }
}

// One JSON value per flight. Accepts a bare array, an object wrapping the
// array under "flights", "results" or "data", or a single flight object.
pub fn split_payload(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            for key in ["flights", "results", "data"] {
                if let Some(Value::Array(_)) = map.get(key) {
                    if let Some(Value::Array(items)) = map.remove(key) {
                        return items;
                    }
                }
            }
            vec![Value::Object(map)]
        }
        Value::Null => vec![],
        other => vec![other],
    }
}

pub struct Normalizer {
    config: NormalizerConfig,
    clock: Arc<dyn Clock>,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn ttl_for(&self, program: &str) -> Duration {
        let ttl = self
            .config
            .program_ttls
            .get(program)
            .copied()
            .unwrap_or(self.config.default_ttl);
        // expires_at must land strictly after scraped_at
        ttl.max(Duration::from_secs(1))
    }

    pub fn normalize(
        &self,
        raw: &Value,
        source_program: &str,
    ) -> Result<FlightAvailability, NormalizationError> {
        self.normalize_at(raw, source_program, self.clock.now())
    }

    // Pure apart from the freshly generated id.
    pub fn normalize_at(
        &self,
        raw: &Value,
        source_program: &str,
        now: DateTime<Utc>,
    ) -> Result<FlightAvailability, NormalizationError> {
        let fields = raw.as_object().ok_or(NormalizationError::NotAnObject)?;
        let parsed = RawFlight { fields };

        let origin = normalize_airport("origin", parsed.required_text("origin", ORIGIN_KEYS)?)?;
        let destination = normalize_airport(
            "destination",
            parsed.required_text("destination", DESTINATION_KEYS)?,
        )?;
        if origin == destination {
            return Err(NormalizationError::SameEndpoints(origin));
        }

        let connection_airports = match parsed.pick(CONNECTION_KEYS) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(code) => normalize_airport("connection_airports", code),
                    other => Err(NormalizationError::InvalidAirport {
                        field: "connection_airports",
                        value: other.to_string(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(NormalizationError::InvalidValue {
                    field: "connection_airports",
                    value: other.to_string(),
                })
            }
            None => vec![],
        };

        let stops = match parsed.pick(STOPS_KEYS) {
            Some(value) => coerce_count(value).ok_or_else(|| NormalizationError::InvalidValue {
                field: "stops",
                value: value.to_string(),
            })?,
            None => connection_airports.len() as u32,
        };
        if stops as usize != connection_airports.len() {
            return Err(NormalizationError::StopsMismatch {
                stops,
                airports: connection_airports.len(),
            });
        }

        let cabin_class = match parsed.pick(CABIN_KEYS) {
            Some(value) => {
                let label = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                map_cabin_class(&label)
                    .or(self.config.fallback_cabin)
                    .ok_or(NormalizationError::UnknownCabin(label))?
            }
            None => self
                .config
                .fallback_cabin
                .ok_or(NormalizationError::MissingField("cabin_class"))?,
        };

        let date_text = parsed.required_text("departure_date", DATE_KEYS)?;
        let departure_date =
            parse_departure_date(date_text).ok_or_else(|| NormalizationError::InvalidValue {
                field: "departure_date",
                value: date_text.to_string(),
            })?;

        let flight_number: String = parsed
            .optional_text(FLIGHT_NUMBER_KEYS)
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        let airline = display_airline(parsed.optional_text(AIRLINE_KEYS), &flight_number);

        let duration_minutes = parsed.pick(DURATION_KEYS).and_then(|d| match d {
            Value::String(s) => parse_duration_minutes(s),
            other => coerce_count(other),
        });

        let points_required = parsed.pick(POINTS_KEYS).and_then(|p| match p {
            Value::String(s) => parse_points(s),
            other => coerce_count(other),
        });

        let taxes_fees = parsed
            .pick(TAXES_KEYS)
            .and_then(|t| match t {
                Value::Number(n) => n
                    .as_i64()
                    .and_then(Decimal::from_i64)
                    .or_else(|| n.as_f64().and_then(Decimal::from_f64).map(|d| d.round_dp(2))),
                Value::String(s) => parse_money(s),
                _ => None,
            })
            .filter(|d| !d.is_sign_negative())
            .unwrap_or(Decimal::ZERO);

        let seats_available = parsed.pick(SEATS_KEYS).and_then(coerce_count);
        let departure_time = parsed
            .optional_text(DEPARTURE_TIME_KEYS)
            .and_then(parse_clock_time);
        let arrival_time = parsed
            .optional_text(ARRIVAL_TIME_KEYS)
            .and_then(parse_clock_time);

        let ttl = chrono::Duration::from_std(self.ttl_for(source_program))
            .map_err(|e| NormalizationError::InvalidValue {
                field: "ttl",
                value: e.to_string(),
            })?;

        Ok(FlightAvailability {
            id: Uuid::new_v4().to_string(),
            source_program: source_program.to_string(),
            origin,
            destination,
            airline,
            flight_number,
            departure_date,
            departure_time,
            arrival_time,
            duration_minutes,
            cabin_class,
            points_required,
            taxes_fees,
            seats_available,
            stops,
            connection_airports,
            scraped_at: now,
            expires_at: now + ttl,
            raw_data: raw.clone(),
        })
    }

    // Good records and rejections come back separately.
    pub fn normalize_batch(
        &self,
        payload: Value,
        source_program: &str,
    ) -> (Vec<FlightAvailability>, Vec<NormalizationError>) {
        let now = self.clock.now();
        let mut records = Vec::new();
        let mut rejected = Vec::new();

        for raw in split_payload(payload) {
            match self.normalize_at(&raw, source_program, now) {
                Ok(record) => records.push(record),
                Err(e) => rejected.push(e),
            }
        }

        (records, rejected)
    }
}
