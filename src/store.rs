// Expiring in-memory store for canonical award records.
// Sits between the fetch orchestrator (writers) and the query engine (readers).

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::model::{CabinClass, FlightAvailability, RouteKey};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store index out of sync: {0}")]
    InvariantViolation(String),
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_records: usize,
    pub records_by_program: BTreeMap<String, usize>,
    pub records_by_route: BTreeMap<String, usize>,
    pub oldest_scraped_at: Option<DateTime<Utc>>,
}

// Store contract. A durable backend can stand in for MemoryStore as long as
// it keeps these semantics.
pub trait FlightStore: Send + Sync + 'static {
    fn new(clock: Arc<dyn Clock>) -> Self
    where
        Self: Sized;

    // Inserts under record.id. Same id overwrites, same content does not dedupe.
    fn add(&self, record: FlightAvailability) -> Arc<FlightAvailability>;

    fn add_many(&self, records: Vec<FlightAvailability>) -> Vec<Arc<FlightAvailability>> {
        records.into_iter().map(|r| self.add(r)).collect()
    }

    fn get(&self, id: &str) -> Option<Arc<FlightAvailability>>;

    fn remove(&self, id: &str) -> bool;

    // Non-expired records for one route and date, in insertion order.
    fn search(
        &self,
        origin: &str,
        destination: &str,
        date: NaiveDate,
        cabin_class: Option<CabinClass>,
        program: Option<&str>,
    ) -> Result<Vec<Arc<FlightAvailability>>, StoreError>;

    fn get_all(&self) -> Vec<Arc<FlightAvailability>>;

    // Physically drops expired records. Returns how many went.
    fn clear_expired(&self) -> Result<usize, StoreError>;

    fn clear(&self);

    fn stats(&self, include_expired: bool) -> StoreStats;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    record: Arc<FlightAvailability>,
    seq: u64,
}

#[derive(Default)]
struct Indexes {
    flights: HashMap<String, Entry>,
    by_route: HashMap<RouteKey, Vec<String>>,
    by_expiry: BTreeMap<DateTime<Utc>, HashSet<String>>,
    next_seq: u64,
}

impl Indexes {
    fn unlink(&mut self, id: &str) -> Option<Arc<FlightAvailability>> {
        let entry = self.flights.remove(id)?;
        let record = entry.record;

        let route = record.route();
        if let Some(bucket) = self.by_route.get_mut(&route) {
            bucket.retain(|b| b != id);
            if bucket.is_empty() {
                self.by_route.remove(&route);
            }
        }

        if let Some(set) = self.by_expiry.get_mut(&record.expires_at) {
            set.remove(id);
            if set.is_empty() {
                self.by_expiry.remove(&record.expires_at);
            }
        }

        Some(record)
    }

    fn check(&self) -> Result<(), StoreError> {
        let mut indexed = 0;
        for (route, bucket) in &self.by_route {
            for id in bucket {
                match self.flights.get(id) {
                    Some(entry) if entry.record.route() == *route => indexed += 1,
                    Some(_) => {
                        return Err(StoreError::InvariantViolation(format!(
                            "{id} is filed under the wrong route {route}"
                        )))
                    }
                    None => {
                        return Err(StoreError::InvariantViolation(format!(
                            "route {route} references missing record {id}"
                        )))
                    }
                }
            }
        }

        if indexed != self.flights.len() {
            return Err(StoreError::InvariantViolation(format!(
                "{} records but {indexed} route entries",
                self.flights.len()
            )));
        }

        Ok(())
    }
}

pub struct MemoryStore {
    // One lock over every index so readers never see a half-applied write.
    inner: RwLock<Indexes>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[cfg(test)]
    fn check_invariants(&self) -> Result<(), StoreError> {
        self.inner.read().check()
    }
}

impl FlightStore for MemoryStore {
    fn new(clock: Arc<dyn Clock>) -> Self
    where
        Self: Sized,
    {
        Self {
            inner: RwLock::new(Indexes::default()),
            clock,
        }
    }

    fn add(&self, record: FlightAvailability) -> Arc<FlightAvailability> {
        let record = Arc::new(record);
        let id = record.id.clone();
        let route = record.route();

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        // Re-adding an id on the same route keeps its bucket slot and its
        // place in insertion order.
        let kept_seq = match inner.flights.get(&id) {
            Some(prev) if prev.record.route() == route => {
                let prev_expiry = prev.record.expires_at;
                let prev_seq = prev.seq;
                if let Some(set) = inner.by_expiry.get_mut(&prev_expiry) {
                    set.remove(&id);
                    if set.is_empty() {
                        inner.by_expiry.remove(&prev_expiry);
                    }
                }
                Some(prev_seq)
            }
            Some(_) => {
                inner.unlink(&id);
                None
            }
            None => None,
        };

        let seq = match kept_seq {
            Some(seq) => seq,
            None => {
                inner.by_route.entry(route).or_default().push(id.clone());
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner
            .by_expiry
            .entry(record.expires_at)
            .or_default()
            .insert(id.clone());
        inner.flights.insert(
            id,
            Entry {
                record: Arc::clone(&record),
                seq,
            },
        );

        record
    }

    fn get(&self, id: &str) -> Option<Arc<FlightAvailability>> {
        let now = self.now();
        self.inner
            .read()
            .flights
            .get(id)
            .filter(|e| !e.record.is_expired_at(now))
            .map(|e| Arc::clone(&e.record))
    }

    fn remove(&self, id: &str) -> bool {
        self.inner.write().unlink(id).is_some()
    }

    fn search(
        &self,
        origin: &str,
        destination: &str,
        date: NaiveDate,
        cabin_class: Option<CabinClass>,
        program: Option<&str>,
    ) -> Result<Vec<Arc<FlightAvailability>>, StoreError> {
        let now = self.now();
        let route = RouteKey::new(origin, destination);

        let inner = self.inner.read();
        let Some(bucket) = inner.by_route.get(&route) else {
            return Ok(vec![]);
        };

        let mut results = Vec::new();
        for id in bucket {
            let entry = inner.flights.get(id).ok_or_else(|| {
                error!(%route, id = %id, "route bucket references a missing record");
                StoreError::InvariantViolation(format!(
                    "route {route} references missing record {id}"
                ))
            })?;
            let record = &entry.record;

            if record.is_expired_at(now) || record.departure_date != date {
                continue;
            }
            if cabin_class.is_some_and(|c| c != record.cabin_class) {
                continue;
            }
            if program.is_some_and(|p| p != record.source_program) {
                continue;
            }
            results.push(Arc::clone(record));
        }

        Ok(results)
    }

    fn get_all(&self) -> Vec<Arc<FlightAvailability>> {
        let now = self.now();
        let inner = self.inner.read();

        let mut live: Vec<&Entry> = inner
            .flights
            .values()
            .filter(|e| !e.record.is_expired_at(now))
            .collect();
        live.sort_by_key(|e| e.seq);

        live.into_iter().map(|e| Arc::clone(&e.record)).collect()
    }

    fn clear_expired(&self) -> Result<usize, StoreError> {
        let now = self.now();
        let mut inner = self.inner.write();
        let mut expired: HashSet<String> = HashSet::new();
        while let Some(slot) = inner.by_expiry.first_entry() {
            if *slot.key() >= now {
                break;
            }
            expired.extend(slot.remove());
        }

        let mut removed = 0;
        let mut touched: HashSet<RouteKey> = HashSet::new();
        for id in &expired {
            if let Some(entry) = inner.flights.remove(id) {
                touched.insert(entry.record.route());
                removed += 1;
            }
        }
        // One pass per affected bucket, however many ids it loses.
        for route in touched {
            if let Some(bucket) = inner.by_route.get_mut(&route) {
                bucket.retain(|id| !expired.contains(id));
                if bucket.is_empty() {
                    inner.by_route.remove(&route);
                }
            }
        }
        if cfg!(debug_assertions) {
            inner.check()?;
        }

        if removed > 0 {
            info!(removed, remaining = inner.flights.len(), "cleared expired flights");
        }
        Ok(removed)
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        let dropped = inner.flights.len();
        inner.flights.clear();
        inner.by_route.clear();
        inner.by_expiry.clear();
        info!(dropped, "cleared flight store");
    }

    fn stats(&self, include_expired: bool) -> StoreStats {
        let now = self.now();
        let inner = self.inner.read();

        let mut stats = StoreStats::default();
        for entry in inner.flights.values() {
            let record = &entry.record;
            if !include_expired && record.is_expired_at(now) {
                continue;
            }

            stats.total_records += 1;
            *stats
                .records_by_program
                .entry(record.source_program.clone())
                .or_default() += 1;
            *stats
                .records_by_route
                .entry(record.route().to_string())
                .or_default() += 1;
            stats.oldest_scraped_at = Some(match stats.oldest_scraped_at {
                Some(oldest) => oldest.min(record.scraped_at),
                None => record.scraped_at,
            });
        }

        stats
    }

    fn len(&self) -> usize {
        self.inner.read().flights.len()
    }
}

// Runs clear_expired on a fixed interval until the returned task is aborted.
pub fn spawn_sweeper(store: Arc<dyn FlightStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.clear_expired() {
                Ok(removed) => debug!(removed, "expiry sweep finished"),
                Err(e) => error!(error = %e, "expiry sweep found a corrupted index"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::fixtures::{date, flight, t0};
    use crate::normalizer::{Normalizer, NormalizerConfig};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::thread;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    fn on_route(id: &str, origin: &str, destination: &str) -> FlightAvailability {
        let mut f = flight(id, "aeroplan", Some(50_000));
        f.origin = origin.to_string();
        f.destination = destination.to_string();
        f
    }

    #[test]
    fn search_finds_record_right_after_add() {
        let (_, store) = store();
        store.add(flight("a", "aeroplan", Some(60_000)));

        let found = store.search("JFK", "LHR", date(), None, None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");

        // lower-case routes resolve to the same bucket
        assert_eq!(store.search("jfk", "lhr", date(), None, None).unwrap().len(), 1);
    }

    #[test]
    fn search_applies_date_cabin_and_program() {
        let (_, store) = store();
        store.add(flight("a", "aeroplan", Some(60_000)));

        let mut other_day = flight("b", "aeroplan", Some(60_000));
        other_day.departure_date = date().succ_opt().unwrap();
        store.add(other_day);

        let mut economy = flight("c", "united_mileageplus", Some(30_000));
        economy.cabin_class = CabinClass::Economy;
        store.add(economy);

        let ids = |v: Vec<Arc<FlightAvailability>>| v.iter().map(|f| f.id.clone()).collect::<Vec<_>>();

        assert_eq!(ids(store.search("JFK", "LHR", date(), None, None).unwrap()), vec!["a", "c"]);
        assert_eq!(
            ids(store.search("JFK", "LHR", date(), Some(CabinClass::Economy), None).unwrap()),
            vec!["c"]
        );
        assert_eq!(
            ids(store.search("JFK", "LHR", date(), None, Some("aeroplan")).unwrap()),
            vec!["a"]
        );
        assert!(store.search("JFK", "CDG", date(), None, None).unwrap().is_empty());
    }

    #[test]
    fn record_with_thirty_minute_ttl_disappears_after_expiry() {
        let (clock, store) = store();
        store.add(flight("a", "aeroplan", Some(60_000)));

        clock.advance(ChronoDuration::minutes(29));
        assert_eq!(store.search("JFK", "LHR", date(), None, None).unwrap().len(), 1);
        assert_eq!(store.get_all().len(), 1);

        clock.advance(ChronoDuration::minutes(2));
        assert!(store.search("JFK", "LHR", date(), None, None).unwrap().is_empty());
        assert!(store.get_all().is_empty());
        assert!(store.get("a").is_none());

        // still physically present until the sweep runs
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear_expired().unwrap(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn duplicate_id_overwrites_in_place() {
        let (_, store) = store();
        store.add(flight("a", "aeroplan", Some(60_000)));
        store.add(flight("b", "aeroplan", Some(70_000)));
        store.add(flight("a", "aeroplan", Some(55_000)));

        let found = store.search("JFK", "LHR", date(), None, None).unwrap();
        let ids: Vec<_> = found.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(found[0].points_required, Some(55_000));
        assert_eq!(store.len(), 2);
        store.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_id_on_a_new_route_moves_buckets() {
        let (_, store) = store();
        store.add(on_route("a", "JFK", "LHR"));
        store.add(on_route("a", "SFO", "NRT"));

        assert!(store.search("JFK", "LHR", date(), None, None).unwrap().is_empty());
        assert_eq!(store.search("SFO", "NRT", date(), None, None).unwrap().len(), 1);
        assert_eq!(store.stats(false).records_by_route.len(), 1);
        store.check_invariants().unwrap();
    }

    #[test]
    fn identical_content_under_new_id_is_not_deduped() {
        let (_, store) = store();
        store.add(flight("a", "aeroplan", Some(60_000)));
        store.add(flight("b", "aeroplan", Some(60_000)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn clear_expired_keeps_indexes_consistent() {
        let (clock, store) = store();

        for i in 0..20 {
            let mut f = on_route(&format!("f{i}"), "JFK", if i % 2 == 0 { "LHR" } else { "CDG" });
            f.expires_at = t0() + ChronoDuration::minutes(i);
            store.add(f);
        }

        clock.advance(ChronoDuration::seconds(10 * 60 + 30));
        let removed = store.clear_expired().unwrap();
        assert_eq!(removed, 11);
        assert_eq!(store.len(), 9);
        store.check_invariants().unwrap();

        let inner = store.inner.read();
        for (route, bucket) in &inner.by_route {
            for id in bucket {
                assert!(inner.flights.contains_key(id), "{route} lost {id}");
            }
        }
        let bucketed: usize = inner.by_route.values().map(Vec::len).sum();
        assert_eq!(bucketed, inner.flights.len());
    }

    #[test]
    fn remove_and_clear() {
        let (_, store) = store();
        store.add(flight("a", "aeroplan", None));
        store.add(on_route("b", "SFO", "NRT"));

        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert_eq!(store.len(), 1);
        store.check_invariants().unwrap();

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.stats(true), StoreStats::default());
    }

    #[test]
    fn stats_count_live_records_unless_asked_for_expired() {
        let (clock, store) = store();
        store.add(flight("a", "aeroplan", None));

        let mut later = on_route("b", "SFO", "NRT");
        later.source_program = "united_mileageplus".to_string();
        later.scraped_at = t0() + ChronoDuration::minutes(5);
        later.expires_at = t0() + ChronoDuration::hours(2);
        store.add(later);

        let stats = store.stats(false);
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.records_by_program["aeroplan"], 1);
        assert_eq!(stats.records_by_route["SFO-NRT"], 1);
        assert_eq!(stats.oldest_scraped_at, Some(t0()));

        clock.advance(ChronoDuration::hours(1));
        let stats = store.stats(false);
        assert_eq!(stats.total_records, 1);
        assert!(!stats.records_by_program.contains_key("aeroplan"));
        assert_eq!(stats.oldest_scraped_at, Some(t0() + ChronoDuration::minutes(5)));

        assert_eq!(store.stats(true).total_records, 2);
    }

    #[test]
    fn get_all_preserves_insertion_order() {
        let (_, store) = store();
        for (i, dest) in ["LHR", "CDG", "LHR", "FRA"].iter().enumerate() {
            store.add(on_route(&format!("f{i}"), "JFK", dest));
        }
        let ids: Vec<_> = store.get_all().iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids, vec!["f0", "f1", "f2", "f3"]);
    }

    #[test]
    fn concurrent_writers_keep_indexes_consistent() {
        let (_, store) = store();
        let store = Arc::new(store);
        let routes = ["LHR", "CDG", "FRA", "NRT"];

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for j in 0..250 {
                        let id = format!("t{t}-{}", j % 50);
                        store.add(on_route(&id, "JFK", routes[j % routes.len()]));
                        if j % 7 == 0 {
                            store.remove(&format!("t{t}-{}", (j + 3) % 50));
                        }
                        let _ = store.search("JFK", routes[j % routes.len()], date(), None, None);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        store.check_invariants().unwrap();
        assert!(store.len() <= 8 * 50);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_expired_records() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store: Arc<dyn FlightStore> = Arc::new(MemoryStore::new(clock.clone()));
        store.add(flight("a", "aeroplan", None));

        let sweeper = spawn_sweeper(Arc::clone(&store), Duration::from_secs(60));
        clock.advance(ChronoDuration::hours(1));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(store.len(), 0);
        sweeper.abort();
    }

    #[test]
    fn normalized_payload_is_searchable_by_route() {
        let (clock, store) = store();
        let normalizer = Normalizer::new(NormalizerConfig::default(), clock.clone());
        let raw = json!({
            "origin": "jfk",
            "destination": "lhr",
            "stops": 1,
            "connection_airports": ["BOS"],
            "cabin": "biz",
            "date": "2025-07-14",
            "miles": "85,000"
        });

        store.add(normalizer.normalize(&raw, "aeroplan").unwrap());

        let found = store.search("JFK", "LHR", date(), None, None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cabin_class, CabinClass::Business);
        assert_eq!(found[0].connection_airports, vec!["BOS"]);
        assert_eq!(
            store
                .search("JFK", "LHR", date(), Some(CabinClass::Business), Some("aeroplan"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn readding_an_id_keeps_its_place_in_get_all() {
        let (_, store) = store();
        store.add(flight("a", "aeroplan", Some(60_000)));
        store.add(flight("b", "aeroplan", Some(70_000)));
        store.add(flight("a", "aeroplan", Some(55_000)));

        let listed: Vec<_> = store.get_all().iter().map(|f| f.id.clone()).collect();
        let searched: Vec<_> = store
            .search("JFK", "LHR", date(), None, None)
            .unwrap()
            .iter()
            .map(|f| f.id.clone())
            .collect();
        assert_eq!(listed, vec!["a", "b"]);
        assert_eq!(listed, searched);
    }

    #[test]
    fn sweeping_one_crowded_route_keeps_survivor_order() {
        let (clock, store) = store();
        for i in 0..1_000 {
            let mut f = flight(&format!("f{i}"), "aeroplan", None);
            f.expires_at = if i % 10 == 0 {
                t0() + ChronoDuration::hours(2)
            } else {
                t0() + ChronoDuration::minutes(1)
            };
            store.add(f);
        }

        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(store.clear_expired().unwrap(), 900);
        store.check_invariants().unwrap();

        let ids: Vec<_> = store
            .search("JFK", "LHR", date(), None, None)
            .unwrap()
            .iter()
            .map(|f| f.id.clone())
            .collect();
        let expected: Vec<_> = (0..1_000).step_by(10).map(|i| format!("f{i}")).collect();
        assert_eq!(ids, expected);
        assert_eq!(store.inner.read().by_expiry.len(), 1);
    }
}
