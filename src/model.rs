// Canonical award-availability record and the small value types around it.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinClass {
    Economy,
    PremiumEconomy,
    Business,
    First,
}

impl CabinClass {
    pub const ALL: [CabinClass; 4] = [
        CabinClass::Economy,
        CabinClass::PremiumEconomy,
        CabinClass::Business,
        CabinClass::First,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CabinClass::Economy => "economy",
            CabinClass::PremiumEconomy => "premium_economy",
            CabinClass::Business => "business",
            CabinClass::First => "first",
        }
    }
}

impl fmt::Display for CabinClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Only the canonical names parse here. Loyalty-program vocabulary ("biz",
// "Polaris", "J") is the normalizer's job.
impl FromStr for CabinClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "economy" => Ok(CabinClass::Economy),
            "premium_economy" => Ok(CabinClass::PremiumEconomy),
            "business" => Ok(CabinClass::Business),
            "first" => Ok(CabinClass::First),
            other => Err(format!("unknown cabin class: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub origin: String,
    pub destination: String,
}

impl RouteKey {
    pub fn new(origin: &str, destination: &str) -> Self {
        Self {
            origin: origin.trim().to_ascii_uppercase(),
            destination: destination.trim().to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.destination)
    }
}

// Three uppercase ASCII letters.
pub fn is_airport_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightAvailability {
    pub id: String,
    pub source_program: String,

    pub origin: String,
    pub destination: String,

    pub airline: String,
    pub flight_number: String,
    pub departure_date: NaiveDate,
    #[serde(with = "clock_time")]
    pub departure_time: Option<NaiveTime>,
    #[serde(with = "clock_time")]
    pub arrival_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,

    pub cabin_class: CabinClass,
    pub points_required: Option<u32>,
    pub taxes_fees: Decimal,
    pub seats_available: Option<u32>,

    pub stops: u32,
    pub connection_airports: Vec<String>,

    pub scraped_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    // Kept for diagnostics only. Never serialized, never compared.
    #[serde(skip)]
    pub raw_data: serde_json::Value,
}

impl FlightAvailability {
    pub fn route(&self) -> RouteKey {
        RouteKey {
            origin: self.origin.clone(),
            destination: self.destination.clone(),
        }
    }

    // Stale strictly after expires_at.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_direct(&self) -> bool {
        self.stops == 0
    }
}

impl PartialEq for FlightAvailability {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.source_program == other.source_program
            && self.origin == other.origin
            && self.destination == other.destination
            && self.airline == other.airline
            && self.flight_number == other.flight_number
            && self.departure_date == other.departure_date
            && self.departure_time == other.departure_time
            && self.arrival_time == other.arrival_time
            && self.duration_minutes == other.duration_minutes
            && self.cabin_class == other.cabin_class
            && self.points_required == other.points_required
            && self.taxes_fees == other.taxes_fees
            && self.seats_available == other.seats_available
            && self.stops == other.stops
            && self.connection_airports == other.connection_airports
            && self.scraped_at == other.scraped_at
            && self.expires_at == other.expires_at
    }
}

// Local clock times go over the wire as "HH:MM" (or null).
mod clock_time {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(t) => serializer.serialize_str(&t.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => NaiveTime::parse_from_str(&s, FORMAT)
                .map(Some)
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    pub fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()
    }

    // A valid nonstop JFK-LHR record; tests tweak the fields they care about.
    pub fn flight(id: &str, program: &str, points: Option<u32>) -> FlightAvailability {
        FlightAvailability {
            id: id.to_string(),
            source_program: program.to_string(),
            origin: "JFK".to_string(),
            destination: "LHR".to_string(),
            airline: "Air Canada".to_string(),
            flight_number: "AC100".to_string(),
            departure_date: date(),
            departure_time: NaiveTime::from_hms_opt(18, 30, 0),
            arrival_time: NaiveTime::from_hms_opt(6, 40, 0),
            duration_minutes: Some(430),
            cabin_class: CabinClass::Business,
            points_required: points,
            taxes_fees: Decimal::new(5610, 2),
            seats_available: Some(2),
            stops: 0,
            connection_airports: vec![],
            scraped_at: t0(),
            expires_at: t0() + Duration::minutes(30),
            raw_data: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cabin_class_round_trips_canonical_names() {
        for cabin in CabinClass::ALL {
            assert_eq!(cabin.as_str().parse::<CabinClass>().unwrap(), cabin);
        }
        assert!("biz".parse::<CabinClass>().is_err());
    }

    #[test]
    fn airport_code_must_be_three_uppercase_letters() {
        assert!(is_airport_code("JFK"));
        assert!(!is_airport_code("jfk"));
        assert!(!is_airport_code("JF"));
        assert!(!is_airport_code("JFK1"));
        assert!(!is_airport_code("J1K"));
    }

    #[test]
    fn equality_ignores_raw_data() {
        let a = fixtures::flight("a", "aeroplan", Some(60_000));
        let mut b = a.clone();
        b.raw_data = serde_json::json!({"cabin": "biz"});
        assert_eq!(a, b);

        b.points_required = Some(70_000);
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_times_as_clock_strings_without_raw_data() {
        let mut flight = fixtures::flight("a", "aeroplan", Some(60_000));
        flight.raw_data = serde_json::json!({"secret": true});
        flight.arrival_time = None;

        let value = serde_json::to_value(&flight).unwrap();
        assert_eq!(value["departure_time"], "18:30");
        assert!(value["arrival_time"].is_null());
        assert_eq!(value["cabin_class"], "business");
        assert!(value.get("raw_data").is_none());

        let back: FlightAvailability = serde_json::from_value(value).unwrap();
        assert_eq!(back, flight);
    }

    #[test]
    fn expiry_is_strictly_after_expires_at() {
        let flight = fixtures::flight("a", "aeroplan", None);
        assert!(!flight.is_expired_at(flight.expires_at));
        assert!(flight.is_expired_at(flight.expires_at + chrono::Duration::seconds(1)));
    }
}
