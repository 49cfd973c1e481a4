use std::{sync::Arc, time::Duration};

use anyhow::Context;
use award_search::{
    init_logging, load_app_config, AwardSearch, CabinClass, DemoFetcher, FetcherRegistry,
    SearchRequest, SortKey,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "award-search")]
#[command(about = "Search award-flight availability across loyalty programs")]
struct Cli {
    /// Programs served by the synthetic demo fetcher.
    #[arg(long, value_delimiter = ',', default_value = "demo", global = true)]
    demo_programs: Vec<String>,

    /// Seed for repeatable demo payloads.
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search one route and date, printing the response as JSON.
    Search(RouteArgs),
    /// Repeat one search on an interval, sweeping expired records between runs.
    Watch(WatchArgs),
    /// List known loyalty programs.
    Programs,
    /// Show which programs a search on this route would consult.
    Recommend {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        destination: String,
    },
    /// Print store and fetch statistics, optionally after one warm-up search.
    Stats {
        #[arg(long, requires_all = ["destination", "date"])]
        origin: Option<String>,
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Debug, Args)]
struct RouteArgs {
    #[arg(long)]
    origin: String,
    #[arg(long)]
    destination: String,
    #[arg(long)]
    date: NaiveDate,
    #[arg(long)]
    cabin: Option<CabinClass>,
    #[arg(long, value_delimiter = ',')]
    programs: Option<Vec<String>>,
    #[arg(long, default_value_t = 1)]
    passengers: u8,
    #[arg(long)]
    max_points: Option<u32>,
    #[arg(long)]
    direct_only: bool,
    #[arg(long = "airline")]
    airlines: Vec<String>,
    #[arg(long, default_value = "points")]
    sort: String,
    #[arg(long)]
    no_cache: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(flatten)]
    route: RouteArgs,
    /// Seconds between searches.
    #[arg(long, default_value_t = 300)]
    every: u64,
}

impl RouteArgs {
    fn into_request(self) -> SearchRequest {
        SearchRequest {
            cabin_class: self.cabin,
            programs: self.programs,
            passengers: self.passengers,
            max_points: self.max_points,
            direct_only: self.direct_only,
            airlines: (!self.airlines.is_empty()).then_some(self.airlines),
            sort: SortKey::from(self.sort.as_str()),
            use_cache: !self.no_cache,
            limit: self.limit,
            ..SearchRequest::new(&self.origin, &self.destination, self.date)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("received shutdown signal, stopping watch");
}

async fn watch(service: &AwardSearch, args: WatchArgs, sweep_every: Duration) -> anyhow::Result<()> {
    let sweeper = service.spawn_sweeper(sweep_every);
    let request = args.route.into_request();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.every.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let response = service.search(request.clone()).await?;
                let summary = json!({
                    "count": response.count,
                    "from_cache": response.from_cache,
                    "complete": response.complete,
                    "cheapest": response.flights.iter().filter_map(|f| f.points_required).min(),
                    "stored": service.store_stats(false).total_records,
                });
                println!("{summary}");
            }
            () = &mut shutdown => break,
        }
    }

    sweeper.abort();
    Ok(())
}

fn demo_registry(programs: &[String], seed: Option<u64>) -> FetcherRegistry {
    programs
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .enumerate()
        .fold(FetcherRegistry::new(), |registry, (i, program)| {
            let fetcher = match seed {
                Some(seed) => DemoFetcher::new(program).with_seed(seed.wrapping_add(i as u64)),
                None => DemoFetcher::new(program),
            };
            registry.with(Arc::new(fetcher))
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_app_config().context("reading configuration")?;
    init_logging(&config.log_level).context("setting up logging")?;

    let cli = Cli::parse();
    let service = AwardSearch::from_config(&config, demo_registry(&cli.demo_programs, cli.seed));
    info!(programs = ?cli.demo_programs, "award-search ready");

    let output = match cli.command {
        Commands::Search(args) => {
            let response = service.search(args.into_request()).await?;
            serde_json::to_value(&response)?
        }
        Commands::Watch(args) => {
            watch(&service, args, config.sweep_interval()).await?;
            json!({
                "store": service.store_stats(true),
                "fetch": service.fetch_stats(),
            })
        }
        Commands::Programs => {
            let programs = service.programs();
            json!({ "programs": programs, "count": programs.len() })
        }
        Commands::Recommend {
            origin,
            destination,
        } => serde_json::to_value(service.recommend_programs(&origin, &destination)?)?,
        Commands::Stats {
            origin,
            destination,
            date,
        } => {
            if let (Some(origin), Some(destination), Some(date)) = (origin, destination, date) {
                service
                    .search(SearchRequest::new(&origin, &destination, date))
                    .await?;
            }
            json!({
                "store": service.store_stats(false),
                "fetch": service.fetch_stats(),
                "breakers": service.orchestrator().breaker_states(),
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
