//! Configuration resolved once at start-up from the environment.
//!
//! No CLI flags: every knob is an environment variable with a default, except
//! `WORKER_BASE_URLS` (always required) and `REDIS_URL` (required for the
//! redis store backend).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Which key/value backend persists queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// External Redis instance (production).
    #[default]
    Redis,
    /// In-process store; state dies with the process. Tests and local dev.
    Memory,
}

/// Dispatcher retry behavior between selection rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Tight 2 s re-probe bounded by an attempt budget of `max_attempts * 10`.
    #[default]
    CircuitBreaker,
    /// Exponential `initial_delay..max_delay` sleep between rounds.
    BackoffPerRound,
}

/// Per-operation deadlines for southbound worker calls.
#[derive(Debug, Clone)]
pub struct WorkerTimeouts {
    pub health: Duration,
    pub search: Duration,
    pub warmup: Duration,
    pub restart: Duration,
    pub refresh: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_millis(7_000),
            search: Duration::from_millis(30_000),
            warmup: Duration::from_millis(20_000),
            restart: Duration::from_millis(15_000),
            refresh: Duration::from_millis(15_000),
        }
    }
}

/// Retry parameters shared by the dispatcher and the job queue.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Queue-level attempts per job; also scales the dispatcher budget.
    pub max_attempts: u32,
    /// First sleep in backoff-per-round dispatch mode.
    pub initial_delay: Duration,
    /// Cap for every exponential backoff in the system.
    pub max_delay: Duration,
    /// Longest a single dispatch may wait for any worker to become free.
    pub wait_for_worker_max: Duration,
    /// Tick of the background sweeper (stalled jobs, delayed promotion).
    pub health_check_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            wait_for_worker_max: Duration::from_millis(300_000),
            health_check_interval: Duration::from_millis(5_000),
        }
    }
}

/// Fully resolved service settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub redis_url: Option<String>,
    /// Worker base URLs, trailing slashes stripped, 1-based indexing.
    pub worker_base_urls: Vec<String>,
    pub store_backend: StoreBackend,
    pub dispatch_mode: DispatchMode,
    /// How long terminal job records (and batch sets) remain readable.
    pub job_results_ttl_sec: u64,
    /// TTL of the prompt-result cache.
    pub cache_ttl_sec: u64,
    pub worker_timeouts: WorkerTimeouts,
    /// Per-dispatch deadline; exceeding it spends one job attempt.
    pub search_job_timeout: Duration,
    /// Upper bound on the total lifetime of a non-terminal job.
    pub job_lifetime_max: Duration,
    pub retry: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 4001,
            redis_url: None,
            worker_base_urls: Vec::new(),
            store_backend: StoreBackend::default(),
            dispatch_mode: DispatchMode::default(),
            job_results_ttl_sec: 86_400,
            cache_ttl_sec: 604_800,
            worker_timeouts: WorkerTimeouts::default(),
            search_job_timeout: Duration::from_millis(60_000),
            job_lifetime_max: Duration::from_millis(3_600_000),
            retry: RetryConfig::default(),
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve settings through an arbitrary variable lookup.
    ///
    /// Tests use this to avoid mutating process-wide environment state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(port) = lookup("PORT") {
            settings.port = parse_var("PORT", &port)?;
        }

        settings.store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("redis") => StoreBackend::Redis,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidVar {
                    name: "STORE_BACKEND",
                    value: other.to_string(),
                    reason: "expected \"redis\" or \"memory\"".to_string(),
                })
            }
        };

        settings.dispatch_mode = match lookup("DISPATCH_MODE").as_deref() {
            None | Some("circuit-breaker") => DispatchMode::CircuitBreaker,
            Some("backoff") => DispatchMode::BackoffPerRound,
            Some(other) => {
                return Err(ConfigError::InvalidVar {
                    name: "DISPATCH_MODE",
                    value: other.to_string(),
                    reason: "expected \"circuit-breaker\" or \"backoff\"".to_string(),
                })
            }
        };

        settings.redis_url = lookup("REDIS_URL").filter(|s| !s.is_empty());
        if settings.store_backend == StoreBackend::Redis && settings.redis_url.is_none() {
            return Err(ConfigError::MissingVar("REDIS_URL"));
        }

        let raw_urls = lookup("WORKER_BASE_URLS")
            .ok_or(ConfigError::MissingVar("WORKER_BASE_URLS"))?;
        settings.worker_base_urls = parse_worker_urls(&raw_urls)?;

        if let Some(v) = lookup("JOB_RESULTS_TTL_SEC") {
            settings.job_results_ttl_sec = parse_var("JOB_RESULTS_TTL_SEC", &v)?;
        }
        if let Some(v) = lookup("CACHE_TTL_SEC") {
            settings.cache_ttl_sec = parse_var("CACHE_TTL_SEC", &v)?;
        }

        let t = &mut settings.worker_timeouts;
        t.health = duration_var(&lookup, "WORKER_HEALTH", t.health)?;
        t.search = duration_var(&lookup, "WORKER_SEARCH", t.search)?;
        t.warmup = duration_var(&lookup, "WORKER_WARMUP", t.warmup)?;
        t.restart = duration_var(&lookup, "WORKER_RESTART", t.restart)?;
        t.refresh = duration_var(&lookup, "WORKER_REFRESH", t.refresh)?;

        settings.search_job_timeout =
            duration_var(&lookup, "BULL_SEARCH", settings.search_job_timeout)?;
        settings.job_lifetime_max =
            duration_var(&lookup, "BULL_BULK", settings.job_lifetime_max)?;

        let r = &mut settings.retry;
        if let Some(v) = lookup("MAX_ATTEMPTS") {
            r.max_attempts = parse_var("MAX_ATTEMPTS", &v)?;
        }
        r.initial_delay = duration_var(&lookup, "INITIAL_DELAY", r.initial_delay)?;
        r.max_delay = duration_var(&lookup, "MAX_DELAY", r.max_delay)?;
        r.wait_for_worker_max =
            duration_var(&lookup, "WAIT_FOR_WORKER_MAX", r.wait_for_worker_max)?;
        r.health_check_interval =
            duration_var(&lookup, "HEALTH_CHECK_INTERVAL", r.health_check_interval)?;

        Ok(settings)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_base_urls.len()
    }
}

fn parse_worker_urls(raw: &str) -> Result<Vec<String>, ConfigError> {
    let urls: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if urls.is_empty() {
        return Err(ConfigError::InvalidVar {
            name: "WORKER_BASE_URLS",
            value: raw.to_string(),
            reason: "at least one worker base URL is required".to_string(),
        });
    }
    Ok(urls)
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(name) {
        Some(v) => Ok(Duration::from_millis(parse_var(name, &v)?)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_resolve_with_required_vars() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://127.0.0.1:6379"),
            ("WORKER_BASE_URLS", "http://w1:4101,http://w2:4101"),
        ]))
        .unwrap();

        assert_eq!(settings.port, 4001);
        assert_eq!(settings.worker_count(), 2);
        assert_eq!(settings.job_results_ttl_sec, 86_400);
        assert_eq!(settings.search_job_timeout, Duration::from_secs(60));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.dispatch_mode, DispatchMode::CircuitBreaker);
    }

    #[test]
    fn missing_worker_urls_is_an_error() {
        let err = Settings::from_lookup(lookup_from(&[("REDIS_URL", "redis://x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("WORKER_BASE_URLS")));
    }

    #[test]
    fn redis_url_required_only_for_redis_backend() {
        let err = Settings::from_lookup(lookup_from(&[("WORKER_BASE_URLS", "http://w1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("REDIS_URL")));

        let settings = Settings::from_lookup(lookup_from(&[
            ("WORKER_BASE_URLS", "http://w1"),
            ("STORE_BACKEND", "memory"),
        ]))
        .unwrap();
        assert_eq!(settings.store_backend, StoreBackend::Memory);
    }

    #[test]
    fn trailing_slashes_are_stripped() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("WORKER_BASE_URLS", "http://w1:4101/, http://w2:4101"),
        ]))
        .unwrap();
        assert_eq!(
            settings.worker_base_urls,
            vec!["http://w1:4101", "http://w2:4101"]
        );
    }

    #[test]
    fn timeout_overrides_parse_as_millis() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("WORKER_BASE_URLS", "http://w1"),
            ("WORKER_SEARCH", "5000"),
            ("BULL_SEARCH", "10000"),
            ("MAX_ATTEMPTS", "5"),
        ]))
        .unwrap();
        assert_eq!(settings.worker_timeouts.search, Duration::from_secs(5));
        assert_eq!(settings.search_job_timeout, Duration::from_secs(10));
        assert_eq!(settings.retry.max_attempts, 5);
    }

    #[test]
    fn invalid_numeric_value_is_reported() {
        let err = Settings::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("WORKER_BASE_URLS", "http://w1"),
            ("PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "PORT", .. }));
    }
}
