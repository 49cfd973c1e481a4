// Query engine: conjunctive filters plus a stable sort over a store snapshot.
// Never writes to the store.

use std::{cmp::Ordering, sync::Arc};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{CabinClass, FlightAvailability};
use crate::store::{FlightStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    pub program: Option<String>,
    pub programs: Option<Vec<String>>,
    pub max_points: Option<u32>,
    pub min_points: Option<u32>,
    pub direct_only: bool,
    pub max_stops: Option<u32>,
    pub cabin_class: Option<CabinClass>,
    pub airlines: Option<Vec<String>>,
}

impl QueryFilters {
    pub fn matches(&self, flight: &FlightAvailability) -> bool {
        let program_ok = self
            .program
            .as_ref()
            .map_or(true, |p| *p == flight.source_program);

        let programs_ok = self
            .programs
            .as_ref()
            .map_or(true, |ps| ps.contains(&flight.source_program));

        // Unknown cost can't be shown to fit a bound.
        let max_points_ok = self
            .max_points
            .map_or(true, |max| flight.points_required.is_some_and(|p| p <= max));

        let min_points_ok = self
            .min_points
            .map_or(true, |min| flight.points_required.is_some_and(|p| p >= min));

        let direct_ok = !self.direct_only || flight.is_direct();

        let stops_ok = self.max_stops.map_or(true, |max| flight.stops <= max);

        let cabin_ok = self
            .cabin_class
            .map_or(true, |c| c == flight.cabin_class);

        let airline_ok = self.airlines.as_ref().map_or(true, |names| {
            names
                .iter()
                .any(|a| a.trim().eq_ignore_ascii_case(&flight.airline))
        });

        program_ok
            && programs_ok
            && max_points_ok
            && min_points_ok
            && direct_ok
            && stops_ok
            && cabin_ok
            && airline_ok
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum SortKey {
    #[default]
    Points,
    PointsDesc,
    Duration,
    DepartureTime,
}

// Anything unrecognised sorts by points.
impl From<&str> for SortKey {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "points_desc" => SortKey::PointsDesc,
            "duration" => SortKey::Duration,
            "departure_time" => SortKey::DepartureTime,
            _ => SortKey::Points,
        }
    }
}

impl From<String> for SortKey {
    fn from(value: String) -> Self {
        SortKey::from(value.as_str())
    }
}

// Known values ascending, unknown values last.
fn known_first<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// Stable: ties keep their input order.
pub fn sort_flights(flights: &mut [Arc<FlightAvailability>], key: SortKey) {
    match key {
        SortKey::Points => {
            flights.sort_by(|a, b| known_first(a.points_required, b.points_required))
        }
        SortKey::PointsDesc => flights.sort_by(|a, b| {
            known_first(
                a.points_required.map(std::cmp::Reverse),
                b.points_required.map(std::cmp::Reverse),
            )
        }),
        SortKey::Duration => {
            flights.sort_by(|a, b| known_first(a.duration_minutes, b.duration_minutes))
        }
        SortKey::DepartureTime => {
            flights.sort_by(|a, b| known_first(a.departure_time, b.departure_time))
        }
    }
}

pub fn query(
    snapshot: impl IntoIterator<Item = Arc<FlightAvailability>>,
    filters: &QueryFilters,
    sort: SortKey,
) -> Vec<Arc<FlightAvailability>> {
    let mut matched: Vec<_> = snapshot
        .into_iter()
        .filter(|f| filters.matches(f))
        .collect();
    sort_flights(&mut matched, sort);
    matched
}

pub struct QueryEngine {
    store: Arc<dyn FlightStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn FlightStore>) -> Self {
        Self { store }
    }

    pub fn query_route(
        &self,
        origin: &str,
        destination: &str,
        date: NaiveDate,
        filters: &QueryFilters,
        sort: SortKey,
    ) -> Result<Vec<Arc<FlightAvailability>>, StoreError> {
        let snapshot = self.store.search(
            origin,
            destination,
            date,
            filters.cabin_class,
            filters.program.as_deref(),
        )?;
        Ok(query(snapshot, filters, sort))
    }

    pub fn query_all(&self, filters: &QueryFilters, sort: SortKey) -> Vec<Arc<FlightAvailability>> {
        query(self.store.get_all(), filters, sort)
    }
}
