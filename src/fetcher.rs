// Fetcher capability: one implementation per loyalty program, looked up by
// program id. How a fetcher talks to its program is its own business; all the
// rest of the crate sees is a JSON payload or a FetchError.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::model::CabinClass;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("no fetcher registered for program {0}")]
    UnknownProgram(String),

    #[error("blocked by {program}: {reason}")]
    Blocked { program: String, reason: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream error: {status_code} - {message}")]
    Upstream { status_code: u16, message: String },

    #[error("fetch timed out after {0}ms")]
    Timeout(u64),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("fetch task failed: {0}")]
    Task(String),
}

impl FetchError {
    // Worth another attempt inside the same deadline.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Upstream { status_code, .. } => *status_code >= 500 || *status_code == 429,
            _ => false,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, FetchError::Blocked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    pub cabin_class: Option<CabinClass>,
    pub passengers: u8,
}

#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    fn program(&self) -> &str;

    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError>;
}

#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: BTreeMap<String, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Replaces any fetcher already registered for the same program.
    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) {
        let program = fetcher.program().to_string();
        debug!(%program, "registered fetcher");
        self.fetchers.insert(program, fetcher);
    }

    pub fn with(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.register(fetcher);
        self
    }

    pub fn get(&self, program: &str) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(program).cloned()
    }

    pub fn contains(&self, program: &str) -> bool {
        self.fetchers.contains_key(program)
    }

    pub fn programs(&self) -> Vec<String> {
        self.fetchers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

const DEMO_CARRIERS: &[(&str, &str)] = &[
    ("United Airlines", "UA"),
    ("Air Canada", "AC"),
    ("Lufthansa", "LH"),
    ("Singapore Airlines", "SQ"),
    ("ANA", "NH"),
    ("Emirates", "EK"),
    ("Qatar Airways", "QR"),
    ("British Airways", "BA"),
    ("Delta Air Lines", "DL"),
    ("American Airlines", "AA"),
];

const DEMO_HUBS: &[&str] = &["ORD", "YYZ", "FRA", "DXB", "SIN", "HKG", "NRT", "DOH"];

// Synthetic award space in loyalty-site vocabulary ("Business Class",
// "7h 05m", "85,000").
pub struct DemoFetcher {
    program: String,
    rng: Mutex<StdRng>,
    latency: Duration,
}

impl DemoFetcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            rng: Mutex::new(StdRng::from_entropy()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn cabin_label(cabin: CabinClass) -> &'static str {
        match cabin {
            CabinClass::Economy => "Economy",
            CabinClass::PremiumEconomy => "Premium Economy",
            CabinClass::Business => "Business Class",
            CabinClass::First => "First Class",
        }
    }

    fn mileage_range(cabin: CabinClass) -> (u32, u32) {
        match cabin {
            CabinClass::Economy => (15, 45),
            CabinClass::PremiumEconomy => (35, 75),
            CabinClass::Business => (60, 150),
            CabinClass::First => (100, 250),
        }
    }

    fn generate(&self, request: &FetchRequest) -> Value {
        let mut rng = self.rng.lock();
        let cabins: Vec<CabinClass> = match request.cabin_class {
            Some(c) => vec![c],
            None => CabinClass::ALL.to_vec(),
        };

        let count = rng.gen_range(5..=15);
        let mut flights = Vec::with_capacity(count);

        for _ in 0..count {
            let cabin = *cabins.choose(&mut *rng).unwrap_or(&CabinClass::Economy);
            let (name, code) = *DEMO_CARRIERS.choose(&mut *rng).unwrap_or(&DEMO_CARRIERS[0]);

            let hour: u32 = rng.gen_range(6..=22);
            let minute: u32 = *[0, 15, 30, 45].choose(&mut *rng).unwrap_or(&0);
            let duration_h: u32 = rng.gen_range(2..=16);
            let duration_m: u32 = *[0, 5, 15, 30, 45].choose(&mut *rng).unwrap_or(&0);
            let total = hour * 60 + minute + duration_h * 60 + duration_m;
            let (arr_h, arr_m) = ((total / 60) % 24, total % 60);

            let (lo, hi) = Self::mileage_range(cabin);
            let miles = rng.gen_range(lo..=hi) * 1000;

            let stops: usize = *[0, 0, 0, 1, 1, 2].choose(&mut *rng).unwrap_or(&0);
            let via: Vec<&str> = DEMO_HUBS
                .choose_multiple(&mut *rng, stops)
                .copied()
                .filter(|hub| *hub != request.origin && *hub != request.destination)
                .collect();

            flights.push(json!({
                "from": request.origin,
                "to": request.destination,
                "date": request.departure_date.format("%Y-%m-%d").to_string(),
                "carrier": name,
                "flight": format!("{code} {}", rng.gen_range(100..=9999)),
                "depart_time": format!("{hour:02}:{minute:02}"),
                "arrive_time": format!("{arr_h:02}:{arr_m:02}"),
                "duration": format!("{duration_h}h {duration_m:02}m"),
                "cabin": Self::cabin_label(cabin),
                "miles": format_thousands(miles),
                "taxes": format!("${:.2}", rng.gen_range(50.0..800.0)),
                "seats_left": rng.gen_range(1..=9),
                "num_stops": via.len(),
                "via": via,
            }));
        }

        json!({ "program": self.program, "flights": flights })
    }
}

fn format_thousands(n: u32) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl Fetcher for DemoFetcher {
    fn program(&self) -> &str {
        &self.program
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let payload = self.generate(request);
        debug!(program = %self.program, origin = %request.origin, destination = %request.destination, "demo payload generated");
        Ok(payload)
    }
}
