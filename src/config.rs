use std::{env, net::SocketAddr, num::NonZeroUsize, time::Duration};

use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    db_path: String,
    db_max_connections: u32,
    hn_base_url: String,
    hn_max_concurrency: NonZeroUsize,
    hn_request_timeout: Duration,
    poll_interval: Duration,
    poll_eager_count: usize,
    poll_min_rank_pairs: usize,
    event_ring_capacity: usize,
    extract_timeout: Duration,
    extract_max_bytes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Load and validate the relay configuration from environment variables.
    ///
    /// Every variable has a default; only malformed values produce an error.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_bind = parse_socket_addr("HN_RELAY_HTTP_BIND", "0.0.0.0:8080")?;
        let db_path = env::var("HN_RELAY_DB_PATH").unwrap_or_else(|_| "hn.db".to_string());
        let db_max_connections = parse_u32("HN_RELAY_DB_MAX_CONNECTIONS", 10)?;

        let hn_base_url = env::var("HN_API_BASE_URL")
            .unwrap_or_else(|_| "https://hacker-news.firebaseio.com/v0/".to_string());
        let hn_max_concurrency = parse_non_zero_usize("HN_MAX_CONCURRENCY", 10)?;
        let hn_request_timeout = parse_duration_ms("HN_REQUEST_TIMEOUT_MS", 15_000)?;

        let poll_interval = Duration::from_secs(parse_u64("HN_RELAY_POLL_INTERVAL_SECS", 300)?);
        let poll_eager_count = parse_usize("HN_RELAY_POLL_EAGER_COUNT", 60)?;
        let poll_min_rank_pairs = parse_usize("HN_RELAY_POLL_MIN_RANK_PAIRS", 10)?;

        let event_ring_capacity = parse_usize("HN_RELAY_EVENT_RING_CAPACITY", 1000)?;

        let extract_timeout = parse_duration_ms("HN_RELAY_EXTRACT_TIMEOUT_MS", 30_000)?;
        let extract_max_bytes = parse_usize("HN_RELAY_EXTRACT_MAX_BYTES", 1 << 20)?;

        Ok(Self {
            http_bind,
            db_path,
            db_max_connections,
            hn_base_url,
            hn_max_concurrency,
            hn_request_timeout,
            poll_interval,
            poll_eager_count,
            poll_min_rank_pairs,
            event_ring_capacity,
            extract_timeout,
            extract_max_bytes,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn hn_base_url(&self) -> &str {
        &self.hn_base_url
    }

    #[must_use]
    pub fn hn_max_concurrency(&self) -> NonZeroUsize {
        self.hn_max_concurrency
    }

    #[must_use]
    pub fn hn_request_timeout(&self) -> Duration {
        self.hn_request_timeout
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn poll_eager_count(&self) -> usize {
        self.poll_eager_count
    }

    #[must_use]
    pub fn poll_min_rank_pairs(&self) -> usize {
        self.poll_min_rank_pairs
    }

    #[must_use]
    pub fn event_ring_capacity(&self) -> usize {
        self.event_ring_capacity
    }

    #[must_use]
    pub fn extract_timeout(&self) -> Duration {
        self.extract_timeout
    }

    #[must_use]
    pub fn extract_max_bytes(&self) -> usize {
        self.extract_max_bytes
    }
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|e| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(e),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let value = parse_usize(name, default)?;
    NonZeroUsize::new(value).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_ms(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_u64(name, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_relay_env() {
        for name in [
            "HN_RELAY_HTTP_BIND",
            "HN_RELAY_DB_PATH",
            "HN_RELAY_DB_MAX_CONNECTIONS",
            "HN_API_BASE_URL",
            "HN_MAX_CONCURRENCY",
            "HN_REQUEST_TIMEOUT_MS",
            "HN_RELAY_POLL_INTERVAL_SECS",
            "HN_RELAY_POLL_EAGER_COUNT",
            "HN_RELAY_POLL_MIN_RANK_PAIRS",
            "HN_RELAY_EVENT_RING_CAPACITY",
            "HN_RELAY_EXTRACT_TIMEOUT_MS",
            "HN_RELAY_EXTRACT_MAX_BYTES",
        ] {
            // SAFETY: tests serialize environment mutation through ENV_MUTEX.
            unsafe { env::remove_var(name) };
        }
    }

    #[test]
    fn defaults_apply_without_env() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        clear_relay_env();

        let config = Config::from_env().expect("config loads");
        assert_eq!(config.http_bind(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.db_path(), "hn.db");
        assert_eq!(config.hn_max_concurrency().get(), 10);
        assert_eq!(config.hn_request_timeout(), Duration::from_secs(15));
        assert_eq!(config.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.poll_eager_count(), 60);
        assert_eq!(config.poll_min_rank_pairs(), 10);
        assert_eq!(config.event_ring_capacity(), 1000);
        assert_eq!(config.extract_max_bytes(), 1 << 20);
    }

    #[test]
    fn env_overrides_are_honored() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        clear_relay_env();
        // SAFETY: serialized by ENV_MUTEX.
        unsafe {
            env::set_var("HN_RELAY_POLL_INTERVAL_SECS", "60");
            env::set_var("HN_RELAY_POLL_EAGER_COUNT", "5");
            env::set_var("HN_MAX_CONCURRENCY", "3");
        }

        let config = Config::from_env().expect("config loads");
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.poll_eager_count(), 5);
        assert_eq!(config.hn_max_concurrency().get(), 3);
        clear_relay_env();
    }

    #[test]
    fn invalid_value_is_rejected() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        clear_relay_env();
        // SAFETY: serialized by ENV_MUTEX.
        unsafe { env::set_var("HN_MAX_CONCURRENCY", "0") };

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                name: "HN_MAX_CONCURRENCY",
                ..
            })
        ));
        clear_relay_env();
    }
}
