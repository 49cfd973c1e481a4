// Search facade: the one place that validates caller input, decides between
// cache and fetch, and shapes the answer.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::fetcher::{FetchError, FetchRequest, FetcherRegistry};
use crate::model::{is_airport_code, CabinClass, FlightAvailability};
use crate::normalizer::Normalizer;
use crate::orchestrator::{Orchestrator, ProgramFetchStats, ProgramOutcome};
use crate::programs::{self, ProgramListing};
use crate::query::{QueryEngine, QueryFilters, SortKey};
use crate::store::{self, FlightStore, MemoryStore, StoreError, StoreStats};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn one() -> u8 {
    1
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    #[serde(default)]
    pub cabin_class: Option<CabinClass>,
    #[serde(default)]
    pub programs: Option<Vec<String>>,
    #[serde(default = "one")]
    pub passengers: u8,
    #[serde(default)]
    pub max_points: Option<u32>,
    #[serde(default)]
    pub direct_only: bool,
    #[serde(default)]
    pub airlines: Option<Vec<String>>,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default = "yes")]
    pub use_cache: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(origin: &str, destination: &str, departure_date: NaiveDate) -> Self {
        Self {
            origin: origin.to_string(),
            destination: destination.to_string(),
            departure_date,
            cabin_class: None,
            programs: None,
            passengers: 1,
            max_points: None,
            direct_only: false,
            airlines: None,
            sort: SortKey::default(),
            use_cache: true,
            limit: None,
        }
    }

    fn validate(&self) -> Result<(String, String), ServiceError> {
        let (origin, destination) = validate_route(&self.origin, &self.destination)?;

        if !(1..=9).contains(&self.passengers) {
            return Err(ServiceError::InvalidRequest(format!(
                "passengers must be between 1 and 9, got {}",
                self.passengers
            )));
        }
        if self.limit == Some(0) {
            return Err(ServiceError::InvalidRequest("limit must be positive".to_string()));
        }
        if self.max_points == Some(0) {
            return Err(ServiceError::InvalidRequest("max_points must be positive".to_string()));
        }

        Ok((origin, destination))
    }
}

fn validate_route(origin: &str, destination: &str) -> Result<(String, String), ServiceError> {
    let normalized_origin = origin.trim().to_ascii_uppercase();
    let normalized_destination = destination.trim().to_ascii_uppercase();

    if !is_airport_code(&normalized_origin) {
        return Err(ServiceError::InvalidRequest(format!(
            "origin must be a 3-letter airport code, got {origin:?}"
        )));
    }
    if !is_airport_code(&normalized_destination) {
        return Err(ServiceError::InvalidRequest(format!(
            "destination must be a 3-letter airport code, got {destination:?}"
        )));
    }
    if normalized_origin == normalized_destination {
        return Err(ServiceError::InvalidRequest(format!(
            "origin and destination are both {normalized_origin}"
        )));
    }

    Ok((normalized_origin, normalized_destination))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub flights: Vec<FlightAvailability>,
    pub count: usize,
    // True only when nothing had to be fetched.
    pub from_cache: bool,
    pub program_status: Vec<ProgramOutcome>,
    // Every program answered, live or from cache.
    pub complete: bool,
    pub no_results: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRecommendation {
    pub origin: String,
    pub destination: String,
    pub recommended_programs: Vec<String>,
    // What a search without an explicit program list fetches here.
    pub searched_programs: Vec<String>,
}

pub struct AwardSearch {
    store: Arc<dyn FlightStore>,
    engine: QueryEngine,
    orchestrator: Orchestrator,
    clock: Arc<dyn Clock>,
    cache_freshness: Duration,
}

impl AwardSearch {
    pub fn new(
        store: Arc<dyn FlightStore>,
        orchestrator: Orchestrator,
        clock: Arc<dyn Clock>,
        cache_freshness: Duration,
    ) -> Self {
        Self {
            engine: QueryEngine::new(Arc::clone(&store)),
            store,
            orchestrator,
            clock,
            cache_freshness,
        }
    }

    pub fn from_config(config: &AppConfig, registry: FetcherRegistry) -> Self {
        Self::with_clock(config, registry, Arc::new(SystemClock))
    }

    // Wires a fresh MemoryStore, normalizer and orchestrator around `clock`.
    pub fn with_clock(config: &AppConfig, registry: FetcherRegistry, clock: Arc<dyn Clock>) -> Self {
        let store: Arc<dyn FlightStore> = Arc::new(MemoryStore::new(Arc::clone(&clock)));
        let normalizer = Arc::new(Normalizer::new(config.normalizer_config(), Arc::clone(&clock)));
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            normalizer,
            registry,
            config.orchestrator_config(),
            Arc::clone(&clock),
        );
        Self::new(store, orchestrator, clock, config.cache_freshness())
    }

    pub fn store(&self) -> Arc<dyn FlightStore> {
        Arc::clone(&self.store)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        store::spawn_sweeper(self.store(), every)
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, ServiceError> {
        let (origin, destination) = request.validate()?;
        let registry = self.orchestrator.registry();

        let (programs, unknown): (Vec<String>, Vec<String>) = match &request.programs {
            Some(requested) => requested.iter().cloned().partition(|p| registry.contains(p)),
            None => (self.default_programs(&origin, &destination), vec![]),
        };

        self.store.clear_expired()?;

        let filters = QueryFilters {
            programs: request.programs.as_ref().map(|_| programs.clone()),
            max_points: request.max_points,
            direct_only: request.direct_only,
            cabin_class: request.cabin_class,
            airlines: request.airlines.clone(),
            ..Default::default()
        };
        let run_query = || {
            self.engine.query_route(
                &origin,
                &destination,
                request.departure_date,
                &filters,
                request.sort,
            )
        };

        let cached = if request.use_cache { run_query()? } else { vec![] };
        // A program only counts as answered from cache if it has fresh records
        // of its own in the result set.
        let (hits, missing): (Vec<String>, Vec<String>) = {
            let fresh = self.fresh_programs(&cached);
            programs
                .iter()
                .cloned()
                .partition(|p| fresh.contains(p.as_str()))
        };
        let from_cache = !hits.is_empty() && missing.is_empty();

        let mut program_status: Vec<ProgramOutcome> =
            hits.iter().map(|p| ProgramOutcome::cached(p)).collect();
        if from_cache {
            info!(%origin, %destination, flights = cached.len(), "cache hit");
        } else if !missing.is_empty() {
            info!(%origin, %destination, cached = ?hits, fetching = ?missing, "cache miss, fetching");
            let fetch = FetchRequest {
                origin: origin.clone(),
                destination: destination.clone(),
                departure_date: request.departure_date,
                cabin_class: request.cabin_class,
                passengers: request.passengers,
            };
            program_status.extend(self.orchestrator.orchestrate(&fetch, &missing).await.outcomes);
        }
        program_status.extend(
            unknown
                .iter()
                .map(|p| ProgramOutcome::failed(p, &FetchError::UnknownProgram(p.clone()), 0)),
        );

        let mut found = if missing.is_empty() { cached } else { run_query()? };
        if let Some(limit) = request.limit {
            found.truncate(limit);
        }
        let flights: Vec<FlightAvailability> = found.iter().map(|f| (**f).clone()).collect();

        Ok(SearchResponse {
            count: flights.len(),
            no_results: flights.is_empty(),
            complete: program_status.iter().all(|s| s.success),
            flights,
            from_cache,
            program_status,
        })
    }

    // Programs with at least one record scraped inside the freshness window.
    fn fresh_programs<'a>(&self, cached: &'a [Arc<FlightAvailability>]) -> HashSet<&'a str> {
        let Ok(window) = chrono::Duration::from_std(self.cache_freshness) else {
            return HashSet::new();
        };
        let now = self.clock.now();
        cached
            .iter()
            .filter(|f| now - f.scraped_at < window)
            .map(|f| f.source_program.as_str())
            .collect()
    }

    // Registered programs the catalog recommends for the route, or every
    // registered program when none of the recommended ones is.
    fn default_programs(&self, origin: &str, destination: &str) -> Vec<String> {
        let registry = self.orchestrator.registry();
        let recommended: Vec<String> = programs::for_route(origin, destination)
            .into_iter()
            .filter(|p| registry.contains(p))
            .map(str::to_string)
            .collect();
        if recommended.is_empty() {
            registry.programs()
        } else {
            recommended
        }
    }

    pub fn recommend_programs(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<RouteRecommendation, ServiceError> {
        let (origin, destination) = validate_route(origin, destination)?;
        Ok(RouteRecommendation {
            recommended_programs: programs::for_route(&origin, &destination)
                .into_iter()
                .map(str::to_string)
                .collect(),
            searched_programs: self.default_programs(&origin, &destination),
            origin,
            destination,
        })
    }

    pub fn store_stats(&self, include_expired: bool) -> StoreStats {
        self.store.stats(include_expired)
    }

    pub fn fetch_stats(&self) -> BTreeMap<String, ProgramFetchStats> {
        self.orchestrator.fetch_stats()
    }

    // Returns how many records were dropped.
    pub fn clear_cache(&self) -> usize {
        let removed = self.store.len();
        self.store.clear();
        info!(removed, "cache cleared");
        removed
    }

    pub fn clear_expired(&self) -> Result<usize, ServiceError> {
        Ok(self.store.clear_expired()?)
    }

    pub fn programs(&self) -> Vec<ProgramListing> {
        programs::listing(self.orchestrator.registry())
    }
}
