// Fetch orchestration: fan a route/date request out to every requested
// program, push whatever comes back through the normalizer into the store,
// and report per-program success or failure.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
use crate::clock::Clock;
use crate::fetcher::{FetchError, FetchRequest, Fetcher, FetcherRegistry};
use crate::model::FlightAvailability;
use crate::normalizer::Normalizer;
use crate::store::FlightStore;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

// What happens to a payload that shows up after its fetch timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LateResultPolicy {
    #[default]
    Drop,
    Admit,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fetch_timeout: Duration,
    pub max_concurrent_fetches: usize,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub late_results: LateResultPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_concurrent_fetches: 3,
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            late_results: LateResultPolicy::Drop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramOutcome {
    pub program: String,
    pub success: bool,
    pub records_added: usize,
    pub rejected: usize,
    pub error: Option<String>,
    pub timed_out: bool,
    pub blocked: bool,
    pub from_cache: bool,
    pub elapsed_ms: u64,
}

impl ProgramOutcome {
    pub fn succeeded(program: &str, records_added: usize, rejected: usize, elapsed_ms: u64) -> Self {
        Self {
            program: program.to_string(),
            success: true,
            records_added,
            rejected,
            error: None,
            timed_out: false,
            blocked: false,
            from_cache: false,
            elapsed_ms,
        }
    }

    pub fn failed(program: &str, error: &FetchError, elapsed_ms: u64) -> Self {
        Self {
            program: program.to_string(),
            success: false,
            records_added: 0,
            rejected: 0,
            error: Some(error.to_string()),
            timed_out: matches!(error, FetchError::Timeout(_)),
            blocked: error.is_blocked(),
            from_cache: false,
            elapsed_ms,
        }
    }

    pub fn cached(program: &str) -> Self {
        Self {
            from_cache: true,
            ..Self::succeeded(program, 0, 0, 0)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestrationReport {
    pub records: Vec<Arc<FlightAvailability>>,
    pub outcomes: Vec<ProgramOutcome>,
}

impl OrchestrationReport {
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }
}

// Running totals per program across every orchestration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgramFetchStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub records_added: u64,
    pub records_rejected: u64,
    pub late_records_added: u64,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

type FetchStatsMap = Arc<DashMap<String, ProgramFetchStats>>;

// Exponential backoff with jitter so retries from several programs don't line up.
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_ms = (config.initial_backoff.as_millis() as f64
        * config.backoff_multiplier.powf(f64::from(retry_attempt)))
    .min(config.max_backoff.as_millis() as f64);

    let jitter = rand::random::<f64>() * config.jitter_factor * base_ms;
    let backoff_ms = base_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}

async fn fetch_with_retry(
    fetcher: Arc<dyn Fetcher>,
    request: FetchRequest,
    retry: RetryConfig,
) -> Result<Value, FetchError> {
    let mut attempt = 0;
    loop {
        match fetcher.fetch(&request).await {
            Ok(payload) => return Ok(payload),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let backoff = calculate_backoff(attempt, &retry);
                debug!(
                    program = fetcher.program(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retrying fetch"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn ingest(
    normalizer: &Normalizer,
    store: &dyn FlightStore,
    payload: Value,
    program: &str,
) -> (Vec<Arc<FlightAvailability>>, usize) {
    let (records, rejected) = normalizer.normalize_batch(payload, program);
    for e in &rejected {
        warn!(program, error = %e, "dropping flight that failed normalization");
    }
    (store.add_many(records), rejected.len())
}

pub struct Orchestrator {
    store: Arc<dyn FlightStore>,
    normalizer: Arc<Normalizer>,
    registry: FetcherRegistry,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, CircuitBreaker>,
    stats: FetchStatsMap,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn FlightStore>,
        normalizer: Arc<Normalizer>,
        registry: FetcherRegistry,
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            normalizer,
            registry,
            config,
            clock,
            breakers: DashMap::new(),
            stats: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &FetcherRegistry {
        &self.registry
    }

    pub fn fetch_stats(&self) -> BTreeMap<String, ProgramFetchStats> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn breaker_states(&self) -> BTreeMap<String, BreakerState> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    // Emergency use only. Returns how many breakers were not closed.
    pub fn reset_circuit_breakers(&self) -> usize {
        let mut reset = 0;
        for mut breaker in self.breakers.iter_mut() {
            if breaker.state() != BreakerState::Closed {
                reset += 1;
            }
            breaker.reset();
        }
        reset
    }

    // Waits for every program to finish or time out. One failure never
    // aborts its siblings.
    pub async fn orchestrate(&self, request: &FetchRequest, programs: &[String]) -> OrchestrationReport {
        let mut seen = HashSet::new();
        let programs: Vec<&String> = programs.iter().filter(|p| seen.insert(p.as_str())).collect();
        let max_concurrent = self.config.max_concurrent_fetches.max(1);

        info!(
            origin = %request.origin,
            destination = %request.destination,
            date = %request.departure_date,
            programs = programs.len(),
            "starting fetch orchestration"
        );

        let mut results: Vec<(usize, ProgramOutcome, Vec<Arc<FlightAvailability>>)> =
            stream::iter(programs.into_iter().enumerate())
                .map(|(i, program)| async move {
                    let (outcome, records) = self.run_program(program, request).await;
                    (i, outcome, records)
                })
                .buffer_unordered(max_concurrent)
                .collect()
                .await;
        results.sort_by_key(|(i, ..)| *i);

        let mut report = OrchestrationReport::default();
        for (_, outcome, records) in results {
            report.records.extend(records);
            report.outcomes.push(outcome);
        }

        if report.failures() > 0 {
            warn!(
                failures = report.failures(),
                successes = report.successes(),
                "some programs could not be checked"
            );
        }
        info!(
            added = report.records.len(),
            successes = report.successes(),
            "fetch orchestration finished"
        );

        report
    }

    async fn run_program(
        &self,
        program: &str,
        request: &FetchRequest,
    ) -> (ProgramOutcome, Vec<Arc<FlightAvailability>>) {
        let started = Instant::now();

        let Some(fetcher) = self.registry.get(program) else {
            let error = FetchError::UnknownProgram(program.to_string());
            warn!(program, "no fetcher registered");
            return (ProgramOutcome::failed(program, &error, 0), vec![]);
        };

        if !self.allow_call(program) {
            let error = FetchError::CircuitOpen(program.to_string());
            debug!(program, "skipping program while its circuit is open");
            self.record_failure(program, &error);
            return (ProgramOutcome::failed(program, &error, 0), vec![]);
        }

        self.stats.entry(program.to_string()).or_default().attempts += 1;

        let timeout = self.config.fetch_timeout;
        let mut handle = tokio::spawn(fetch_with_retry(
            fetcher,
            request.clone(),
            self.config.retry.clone(),
        ));

        let result = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(FetchError::Task(join_error.to_string())),
            Err(_) => {
                self.handle_late(program, handle);
                Err(FetchError::Timeout(timeout.as_millis() as u64))
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(payload) => {
                let (records, rejected) = ingest(&self.normalizer, self.store.as_ref(), payload, program);
                self.with_breaker(program, CircuitBreaker::success);
                self.record_success(program, records.len(), rejected);
                info!(program, added = records.len(), rejected, elapsed_ms, "program fetched");
                (
                    ProgramOutcome::succeeded(program, records.len(), rejected, elapsed_ms),
                    records,
                )
            }
            Err(error) => {
                self.with_breaker(program, CircuitBreaker::fail);
                self.record_failure(program, &error);
                warn!(program, error = %error, elapsed_ms, "program fetch failed");
                (ProgramOutcome::failed(program, &error, elapsed_ms), vec![])
            }
        }
    }

    fn handle_late(&self, program: &str, handle: JoinHandle<Result<Value, FetchError>>) {
        match self.config.late_results {
            LateResultPolicy::Drop => handle.abort(),
            LateResultPolicy::Admit => {
                let store = Arc::clone(&self.store);
                let normalizer = Arc::clone(&self.normalizer);
                let stats = Arc::clone(&self.stats);
                let program = program.to_string();

                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(payload)) => {
                            let (records, rejected) =
                                ingest(&normalizer, store.as_ref(), payload, &program);
                            if let Some(mut s) = stats.get_mut(&program) {
                                s.late_records_added += records.len() as u64;
                                s.records_rejected += rejected as u64;
                            }
                            info!(program = %program, added = records.len(), "admitted late fetch result");
                        }
                        Ok(Err(e)) => debug!(program = %program, error = %e, "late fetch failed"),
                        Err(e) => debug!(program = %program, error = %e, "late fetch task died"),
                    }
                });
            }
        }
    }

    fn allow_call(&self, program: &str) -> bool {
        self.breakers
            .entry(program.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.breaker.clone()))
            .should_allow_call()
    }

    fn with_breaker(&self, program: &str, f: impl FnOnce(&mut CircuitBreaker)) {
        let mut breaker = self
            .breakers
            .entry(program.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.breaker.clone()));
        f(&mut *breaker);
    }

    fn record_success(&self, program: &str, added: usize, rejected: usize) {
        let mut s = self.stats.entry(program.to_string()).or_default();
        s.successes += 1;
        s.records_added += added as u64;
        s.records_rejected += rejected as u64;
        s.last_success_at = Some(self.clock.now());
    }

    fn record_failure(&self, program: &str, error: &FetchError) {
        let mut s = self.stats.entry(program.to_string()).or_default();
        s.failures += 1;
        if matches!(error, FetchError::Timeout(_)) {
            s.timeouts += 1;
        }
        s.last_error = Some(error.to_string());
        s.last_failure_at = Some(self.clock.now());
    }
}


#[cfg(test)]
mod tests {
    use super::test_fetchers::*;
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::fixtures::{date, t0};
    use crate::normalizer::NormalizerConfig;
    use crate::store::MemoryStore;

    fn request() -> FetchRequest {
        FetchRequest {
            origin: "JFK".to_string(),
            destination: "LHR".to_string(),
            departure_date: date(),
            cabin_class: None,
            passengers: 1,
        }
    }

    fn build(
        registry: FetcherRegistry,
        config: OrchestratorConfig,
    ) -> (Arc<dyn FlightStore>, Orchestrator) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
        let store: Arc<dyn FlightStore> = Arc::new(MemoryStore::new(Arc::clone(&clock)));
        let normalizer = Arc::new(Normalizer::new(NormalizerConfig::default(), Arc::clone(&clock)));
        let orchestrator = Orchestrator::new(Arc::clone(&store), normalizer, registry, config, clock);
        (store, orchestrator)
    }

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig {
            fetch_timeout: Duration::from_secs(1),
            retry: RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn programs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn one_timeout_out_of_three_leaves_the_others_intact() {
        let registry = FetcherRegistry::new()
            .with(Arc::new(StaticFetcher::new("aeroplan", &[60_000, 70_000])))
            .with(Arc::new(StaticFetcher::new("united_mileageplus", &[80_000])))
            .with(Arc::new(
                StaticFetcher::new("virgin_atlantic", &[50_000]).slow(Duration::from_secs(10)),
            ));
        let (store, orchestrator) = build(registry, quick_config());

        let report = orchestrator
            .orchestrate(&request(), &programs(&["aeroplan", "united_mileageplus", "virgin_atlantic"]))
            .await;

        assert_eq!(report.successes(), 2);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.records.len(), 3);

        let failed = &report.outcomes[2];
        assert_eq!(failed.program, "virgin_atlantic");
        assert!(failed.timed_out);
        assert!(!failed.success);

        let found = store.search("JFK", "LHR", date(), None, None).unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|f| f.source_program != "virgin_atlantic"));

        // dropped, not admitted later
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(store.len(), 3);

        let stats = orchestrator.fetch_stats();
        assert_eq!(stats["virgin_atlantic"].timeouts, 1);
        assert_eq!(stats["aeroplan"].records_added, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_are_admitted_when_asked() {
        let registry = FetcherRegistry::new().with(Arc::new(
            StaticFetcher::new("virgin_atlantic", &[50_000]).slow(Duration::from_secs(3)),
        ));
        let config = OrchestratorConfig {
            late_results: LateResultPolicy::Admit,
            ..quick_config()
        };
        let (store, orchestrator) = build(registry, config);

        let report = orchestrator.orchestrate(&request(), &programs(&["virgin_atlantic"])).await;
        assert_eq!(report.failures(), 1);
        assert!(report.records.is_empty());
        assert_eq!(store.len(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(orchestrator.fetch_stats()["virgin_atlantic"].late_records_added, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_inside_the_deadline() {
        let flaky = Arc::new(FlakyFetcher::new("aeroplan", FetchError::Network("reset".into()), 2));
        let registry = FetcherRegistry::new().with(flaky.clone());
        let config = OrchestratorConfig {
            fetch_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let (store, orchestrator) = build(registry, config);

        let report = orchestrator.orchestrate(&request(), &programs(&["aeroplan"])).await;
        assert!(report.all_succeeded());
        assert_eq!(flaky.calls(), 3);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_programs_are_not_retried() {
        let blocked = FetchError::Blocked {
            program: "aeroplan".into(),
            reason: "captcha".into(),
        };
        let flaky = Arc::new(FlakyFetcher::new("aeroplan", blocked, 5));
        let registry = FetcherRegistry::new().with(flaky.clone());
        let (_, orchestrator) = build(registry, OrchestratorConfig::default());

        let report = orchestrator.orchestrate(&request(), &programs(&["aeroplan"])).await;
        assert_eq!(flaky.calls(), 1);
        assert!(report.outcomes[0].blocked);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("captcha"));
    }

    #[tokio::test]
    async fn unknown_programs_are_reported_not_fatal() {
        let registry = FetcherRegistry::new().with(Arc::new(StaticFetcher::new("aeroplan", &[1_000])));
        let (_, orchestrator) = build(registry, quick_config());

        let report = orchestrator
            .orchestrate(&request(), &programs(&["aeroplan", "nope", "aeroplan"]))
            .await;
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes[0].success);
        assert!(!report.outcomes[1].success);
        assert_eq!(
            report.outcomes[1].error.as_deref(),
            Some("no fetcher registered for program nope")
        );
    }

    #[tokio::test]
    async fn rejected_payload_entries_are_counted_not_fatal() {
        struct HalfBroken;

        #[async_trait::async_trait]
        impl Fetcher for HalfBroken {
            fn program(&self) -> &str {
                "aeroplan"
            }

            async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
                let mut flights = payload(request, &[10_000, 20_000]);
                if let Value::Array(items) = &mut flights {
                    items.push(serde_json::json!({"origin": "JFK", "destination": "JFK"}));
                }
                Ok(flights)
            }
        }

        let (store, orchestrator) = build(FetcherRegistry::new().with(Arc::new(HalfBroken)), quick_config());
        let report = orchestrator.orchestrate(&request(), &programs(&["aeroplan"])).await;

        assert!(report.all_succeeded());
        assert_eq!(report.outcomes[0].records_added, 2);
        assert_eq!(report.outcomes[0].rejected, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_the_fetcher() {
        let flaky = Arc::new(FlakyFetcher::new(
            "aeroplan",
            FetchError::Upstream {
                status_code: 500,
                message: "boom".into(),
            },
            100,
        ));
        let config = OrchestratorConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                open_duration: Duration::from_secs(60),
            },
            ..quick_config()
        };
        let (_, orchestrator) = build(FetcherRegistry::new().with(flaky.clone()), config);
        let aeroplan = programs(&["aeroplan"]);

        orchestrator.orchestrate(&request(), &aeroplan).await;
        orchestrator.orchestrate(&request(), &aeroplan).await;
        assert_eq!(orchestrator.breaker_states()["aeroplan"], BreakerState::Open);

        let report = orchestrator.orchestrate(&request(), &aeroplan).await;
        assert_eq!(flaky.calls(), 2);
        assert_eq!(
            report.outcomes[0].error.as_deref(),
            Some("circuit breaker open for aeroplan")
        );

        assert_eq!(orchestrator.reset_circuit_breakers(), 1);
        assert_eq!(orchestrator.breaker_states()["aeroplan"], BreakerState::Closed);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(400));
        assert_eq!(calculate_backoff(6, &config), Duration::from_millis(1_000));

        let jittered = RetryConfig {
            jitter_factor: 0.2,
            ..config
        };
        let b = calculate_backoff(1, &jittered);
        assert!(b >= Duration::from_millis(180) && b <= Duration::from_millis(220));
    }
}
