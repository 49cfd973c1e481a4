// Catalog of the loyalty programs the aggregator knows about, whether or not a
// working fetcher exists for them yet.

use serde::Serialize;

use crate::fetcher::FetcherRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    Implemented,
    // Site actively blocks automated access.
    Blocked,
    Planned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleRoute {
    pub origin: &'static str,
    pub destination: &'static str,
    pub description: &'static str,
}

const fn route(
    origin: &'static str,
    destination: &'static str,
    description: &'static str,
) -> SampleRoute {
    SampleRoute {
        origin,
        destination,
        description,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramInfo {
    pub id: &'static str,
    pub label: &'static str,
    pub status: ProgramStatus,
    pub supported_airlines: &'static [&'static str],
    // Airports where the program's partners have deep award inventory.
    pub hubs: &'static [&'static str],
    pub sample_routes: &'static [SampleRoute],
}

impl ProgramInfo {
    // 2 for a sample route in either direction, plus 1 per endpoint hub.
    fn route_score(&self, origin: &str, destination: &str) -> u8 {
        let sampled = self.sample_routes.iter().any(|r| {
            (r.origin == origin && r.destination == destination)
                || (r.origin == destination && r.destination == origin)
        });
        let hubs = [origin, destination]
            .into_iter()
            .filter(|code| self.hubs.iter().any(|hub| hub == code))
            .count() as u8;
        if sampled {
            hubs + 2
        } else {
            hubs
        }
    }
}

pub static CATALOG: &[ProgramInfo] = &[
    ProgramInfo {
        id: "demo",
        label: "Demo (synthetic availability)",
        status: ProgramStatus::Implemented,
        supported_airlines: &["UA", "AC", "LH", "SQ", "NH", "EK", "QR", "BA", "DL", "AA"],
        hubs: &[],
        sample_routes: &[],
    },
    ProgramInfo {
        id: "aeroplan",
        label: "Air Canada Aeroplan",
        status: ProgramStatus::Blocked,
        supported_airlines: &["AC", "LH", "UA", "NH", "SQ", "TG", "OZ", "SK", "ET", "CM"],
        hubs: &["YYZ", "YUL", "YVR", "FRA", "MUC", "ZRH", "NRT", "SIN", "LHR"],
        sample_routes: &[
            route("YYZ", "LHR", "Toronto to London on Air Canada"),
            route("JFK", "FRA", "New York to Frankfurt on Lufthansa"),
            route("SFO", "NRT", "San Francisco to Tokyo on ANA"),
        ],
    },
    ProgramInfo {
        id: "united_mileageplus",
        label: "United MileagePlus",
        status: ProgramStatus::Blocked,
        supported_airlines: &["UA", "AC", "NH", "LH", "SQ", "TK", "LX", "OS", "NZ"],
        hubs: &["EWR", "ORD", "SFO", "IAD", "DEN", "IAH", "LAX", "NRT", "FRA", "LHR"],
        sample_routes: &[
            route("EWR", "LHR", "Newark to London on United"),
            route("SFO", "NRT", "San Francisco to Tokyo on United or ANA"),
            route("ORD", "FRA", "Chicago to Frankfurt on Lufthansa"),
        ],
    },
    ProgramInfo {
        id: "jetblue_trueblue",
        label: "JetBlue TrueBlue",
        status: ProgramStatus::Planned,
        supported_airlines: &["B6"],
        hubs: &["JFK", "BOS", "FLL", "MCO"],
        sample_routes: &[
            route("JFK", "LHR", "New York to London on Mint"),
            route("BOS", "LHR", "Boston to London on Mint"),
        ],
    },
    ProgramInfo {
        id: "lufthansa_milesmore",
        label: "Lufthansa Miles & More",
        status: ProgramStatus::Planned,
        supported_airlines: &["LH", "LX", "OS", "SN", "EW"],
        hubs: &["FRA", "MUC", "ZRH", "VIE"],
        sample_routes: &[
            route("JFK", "FRA", "New York to Frankfurt on Lufthansa"),
            route("ORD", "MUC", "Chicago to Munich on Lufthansa"),
        ],
    },
    ProgramInfo {
        id: "virgin_atlantic",
        label: "Virgin Atlantic Flying Club",
        status: ProgramStatus::Planned,
        supported_airlines: &["VS", "DL", "AF", "KL"],
        hubs: &["LHR", "MAN", "JFK", "ATL"],
        sample_routes: &[
            route("JFK", "LHR", "New York to London in Upper Class"),
            route("LAX", "LHR", "Los Angeles to London in Upper Class"),
        ],
    },
    ProgramInfo {
        id: "google_flights",
        label: "Google Flights (cash fares)",
        status: ProgramStatus::Blocked,
        supported_airlines: &["*"],
        hubs: &[],
        sample_routes: &[],
    },
];

pub fn lookup(id: &str) -> Option<&'static ProgramInfo> {
    CATALOG.iter().find(|p| p.id == id)
}

// A catalog entry plus whether this process can actually fetch it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramListing {
    pub id: String,
    pub label: String,
    pub status: ProgramStatus,
    pub supported_airlines: Vec<String>,
    pub sample_routes: Vec<SampleRoute>,
    pub registered: bool,
}

impl ProgramListing {
    fn from_info(info: &ProgramInfo, registered: bool) -> Self {
        Self {
            id: info.id.to_string(),
            label: info.label.to_string(),
            status: info.status,
            supported_airlines: info.supported_airlines.iter().map(|a| a.to_string()).collect(),
            sample_routes: info.sample_routes.to_vec(),
            registered,
        }
    }
}

// Programs worth searching for a route, best match first and catalog order
// among equals. Demo is never recommended alongside real programs; it is the
// answer only when nothing in the catalog knows the route.
pub fn for_route(origin: &str, destination: &str) -> Vec<&'static str> {
    let origin = origin.trim().to_ascii_uppercase();
    let destination = destination.trim().to_ascii_uppercase();

    let mut scored: Vec<(u8, &'static str)> = CATALOG
        .iter()
        .filter(|info| info.id != "demo")
        .map(|info| (info.route_score(&origin, &destination), info.id))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    if scored.is_empty() {
        return vec!["demo"];
    }
    scored.into_iter().map(|(_, id)| id).collect()
}

// Catalog order first, then any registered program the catalog doesn't name.
pub fn listing(registry: &FetcherRegistry) -> Vec<ProgramListing> {
    let mut out: Vec<ProgramListing> = CATALOG
        .iter()
        .map(|info| ProgramListing::from_info(info, registry.contains(info.id)))
        .collect();

    for id in registry.programs() {
        if lookup(&id).is_none() {
            out.push(ProgramListing {
                label: id.clone(),
                id,
                status: ProgramStatus::Implemented,
                supported_airlines: vec![],
                sample_routes: vec![],
                registered: true,
            });
        }
    }
    out
}
