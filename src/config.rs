use std::{collections::HashMap, env::VarError, str::FromStr, time::Duration};

use thiserror::Error;

use crate::model::CabinClass;
use crate::normalizer::NormalizerConfig;
use crate::orchestrator::{LateResultPolicy, OrchestratorConfig, RetryConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub log_level: String,
    pub default_ttl_minutes: u64,
    pub program_ttl_minutes: HashMap<String, u64>,
    pub fallback_cabin: Option<CabinClass>,
    pub fetch_timeout_secs: u64,
    pub max_concurrent_fetches: usize,
    pub max_retries: u32,
    pub cache_freshness_minutes: u64,
    pub sweep_interval_secs: u64,
    pub admit_late_results: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_ttl_minutes: 360,
            program_ttl_minutes: HashMap::new(),
            fallback_cabin: None,
            fetch_timeout_secs: 30,
            max_concurrent_fetches: 3,
            max_retries: 2,
            cache_freshness_minutes: 30,
            sweep_interval_secs: 60,
            admit_late_results: false,
        }
    }
}

impl AppConfig {
    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            default_ttl: minutes(self.default_ttl_minutes),
            program_ttls: self
                .program_ttl_minutes
                .iter()
                .map(|(program, m)| (program.clone(), minutes(*m)))
                .collect(),
            fallback_cabin: self.fallback_cabin,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_concurrent_fetches: self.max_concurrent_fetches,
            retry: RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::default()
            },
            late_results: if self.admit_late_results {
                LateResultPolicy::Admit
            } else {
                LateResultPolicy::Drop
            },
            ..OrchestratorConfig::default()
        }
    }

    pub fn cache_freshness(&self) -> Duration {
        minutes(self.cache_freshness_minutes)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

// Process environment, with `.env` read first if one exists.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    build_app_config(|key| std::env::var(key))
}

// Every variable is optional; the lookup keeps tests off the real environment.
pub fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    let defaults = AppConfig::default();

    let parse = |var: &str| -> Result<Option<String>, ConfigError> {
        match lookup(var) {
            Ok(v) if v.trim().is_empty() => Ok(None),
            Ok(v) => Ok(Some(v.trim().to_string())),
            Err(VarError::NotPresent) => Ok(None),
            Err(e) => Err(invalid(var, e)),
        }
    };

    let parse_u64 = |var: &str, default: u64| -> Result<u64, ConfigError> {
        parse_num(var, parse(var)?, default)
    };
    let parse_u32 = |var: &str, default: u32| -> Result<u32, ConfigError> {
        parse_num(var, parse(var)?, default)
    };
    let parse_usize = |var: &str, default: usize| -> Result<usize, ConfigError> {
        parse_num(var, parse(var)?, default)
    };

    let log_level = parse("AWARD_LOG_LEVEL")?.unwrap_or(defaults.log_level);
    let default_ttl_minutes = parse_u64("AWARD_DEFAULT_TTL_MINUTES", defaults.default_ttl_minutes)?;
    let program_ttl_minutes = match parse("AWARD_PROGRAM_TTLS")? {
        Some(raw) => parse_program_ttls(&raw)?,
        None => defaults.program_ttl_minutes,
    };
    let fallback_cabin = parse("AWARD_FALLBACK_CABIN")?
        .map(|raw| {
            raw.parse::<CabinClass>()
                .map_err(|e| invalid("AWARD_FALLBACK_CABIN", e))
        })
        .transpose()?;

    let fetch_timeout_secs = parse_u64("AWARD_FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs)?;
    let max_concurrent_fetches =
        parse_usize("AWARD_MAX_CONCURRENT_FETCHES", defaults.max_concurrent_fetches)?;
    let max_retries = parse_u32("AWARD_MAX_RETRIES", defaults.max_retries)?;
    let cache_freshness_minutes =
        parse_u64("AWARD_CACHE_FRESHNESS_MINUTES", defaults.cache_freshness_minutes)?;
    let sweep_interval_secs = parse_u64("AWARD_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?;
    let admit_late_results = match parse("AWARD_ADMIT_LATE_RESULTS")? {
        Some(raw) => parse_bool("AWARD_ADMIT_LATE_RESULTS", &raw)?,
        None => defaults.admit_late_results,
    };

    if fetch_timeout_secs == 0 {
        return Err(invalid("AWARD_FETCH_TIMEOUT_SECS", "must be at least 1"));
    }
    if max_concurrent_fetches == 0 {
        return Err(invalid("AWARD_MAX_CONCURRENT_FETCHES", "must be at least 1"));
    }
    if sweep_interval_secs == 0 {
        return Err(invalid("AWARD_SWEEP_INTERVAL_SECS", "must be at least 1"));
    }

    Ok(AppConfig {
        log_level,
        default_ttl_minutes,
        program_ttl_minutes,
        fallback_cabin,
        fetch_timeout_secs,
        max_concurrent_fetches,
        max_retries,
        cache_freshness_minutes,
        sweep_interval_secs,
        admit_late_results,
    })
}

fn invalid(var: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidEnvVar {
        var: var.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_num<T>(var: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match raw {
        Some(raw) => raw.parse::<T>().map_err(|e| invalid(var, e)),
        None => Ok(default),
    }
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(var, format!("expected a boolean, got {other:?}"))),
    }
}

// "aeroplan=120, demo=5"
fn parse_program_ttls(raw: &str) -> Result<HashMap<String, u64>, ConfigError> {
    const VAR: &str = "AWARD_PROGRAM_TTLS";
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (program, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(VAR, format!("expected program=minutes, got {pair:?}")))?;
            let program = program.trim();
            if program.is_empty() {
                return Err(invalid(VAR, format!("empty program name in {pair:?}")));
            }
            let m = value
                .trim()
                .parse::<u64>()
                .map_err(|e| invalid(VAR, format!("{program}: {e}")))?;
            Ok((program.to_string(), m))
        })
        .collect()
}
