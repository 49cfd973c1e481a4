// Award-flight availability aggregator: normalize loyalty-program payloads,
// keep them in an expiring store, and answer filtered searches over it.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod fetcher;
pub mod logging;
pub mod model;
pub mod normalizer;
pub mod orchestrator;
pub mod programs;
pub mod query;
pub mod service;
pub mod store;

// Re-export key types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{build_app_config, load_app_config, AppConfig, ConfigError};
pub use fetcher::{DemoFetcher, FetchError, FetchRequest, Fetcher, FetcherRegistry};
pub use logging::init_logging;
pub use model::{CabinClass, FlightAvailability, RouteKey};
pub use normalizer::{NormalizationError, Normalizer, NormalizerConfig};
pub use orchestrator::{
    LateResultPolicy, OrchestrationReport, Orchestrator, OrchestratorConfig, ProgramFetchStats,
    ProgramOutcome, RetryConfig,
};
pub use programs::{ProgramInfo, ProgramListing, ProgramStatus, SampleRoute};
pub use query::{QueryEngine, QueryFilters, SortKey};
pub use service::{AwardSearch, RouteRecommendation, SearchRequest, SearchResponse, ServiceError};
pub use store::{spawn_sweeper, FlightStore, MemoryStore, StoreError, StoreStats};
