//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file shared by every server instance.
    /// Env: `DATABASE_PATH`
    /// Default: platform data directory.
    pub database_path: Option<PathBuf>,

    /// Push gateway endpoint. When unset, pushes are only logged.
    /// Env: `PUSH_GATEWAY_URL`
    pub push_gateway_url: Option<String>,

    /// Bearer key sent to the push gateway.
    /// Env: `PUSH_GATEWAY_KEY`
    pub push_gateway_key: Option<String>,

    /// Maximum device tokens per multi-token gateway call.
    /// Env: `PUSH_BATCH_LIMIT`
    /// Default: `500`
    pub push_batch_limit: usize,

    /// Capacity of the outbound push queue.
    /// Env: `PUSH_QUEUE_CAPACITY`
    /// Default: `1000`
    pub push_queue_capacity: usize,

    /// Capacity of the real-time broadcast queue.
    /// Env: `BROADCAST_QUEUE_CAPACITY`
    /// Default: `1000`
    pub broadcast_queue_capacity: usize,

    /// Capacity of the fire-and-forget side-effect queue.
    /// Env: `TASK_QUEUE_CAPACITY`
    /// Default: `1000`
    pub task_queue_capacity: usize,

    // -- Leases --

    /// Lease time-to-live.
    /// Env: `LOCK_TTL_SECS`
    /// Default: `30`
    pub lock_ttl: Duration,

    /// Delay between lease acquisition attempts.
    /// Env: `LOCK_RETRY_DELAY_MS`
    /// Default: `50`
    pub lock_retry_delay: Duration,

    /// Attempts before acquisition gives up.
    /// Env: `LOCK_MAX_ATTEMPTS`
    /// Default: `32`
    pub lock_max_attempts: u32,

    // -- Requests --

    /// Deadline applied when the caller does not supply one.
    /// Env: `REQUEST_TIMEOUT_SECS`
    /// Default: `30`
    pub request_timeout: Duration,

    /// How far back an unreceived-messages fetch reaches by default.
    /// Env: `BACKFILL_WINDOW_DAYS`
    /// Default: `30`
    pub backfill_window_days: i64,

    /// Sustained requests per second per caller.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Burst size per caller.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,

    /// Interval between websocket pings.
    /// Env: `WS_PING_INTERVAL_SECS`
    /// Default: `25`
    pub ws_ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            push_gateway_url: None,
            push_gateway_key: None,
            push_batch_limit: 500,
            push_queue_capacity: 1000,
            broadcast_queue_capacity: 1000,
            task_queue_capacity: 1000,
            lock_ttl: Duration::from_secs(30),
            lock_retry_delay: Duration::from_millis(50),
            lock_max_attempts: 32,
            request_timeout: Duration::from_secs(30),
            backfill_window_days: 30,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            ws_ping_interval: Duration::from_secs(25),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        config.push_gateway_url = lookup("PUSH_GATEWAY_URL").filter(|v| !v.is_empty());
        config.push_gateway_key = lookup("PUSH_GATEWAY_KEY").filter(|v| !v.is_empty());

        parse_into(&lookup, "PUSH_BATCH_LIMIT", &mut config.push_batch_limit);
        parse_into(&lookup, "PUSH_QUEUE_CAPACITY", &mut config.push_queue_capacity);
        parse_into(
            &lookup,
            "BROADCAST_QUEUE_CAPACITY",
            &mut config.broadcast_queue_capacity,
        );
        parse_into(&lookup, "TASK_QUEUE_CAPACITY", &mut config.task_queue_capacity);

        // -- Leases --

        let mut secs = config.lock_ttl.as_secs();
        parse_into(&lookup, "LOCK_TTL_SECS", &mut secs);
        config.lock_ttl = Duration::from_secs(secs);

        let mut millis = config.lock_retry_delay.as_millis() as u64;
        parse_into(&lookup, "LOCK_RETRY_DELAY_MS", &mut millis);
        config.lock_retry_delay = Duration::from_millis(millis);

        parse_into(&lookup, "LOCK_MAX_ATTEMPTS", &mut config.lock_max_attempts);

        // -- Requests --

        let mut secs = config.request_timeout.as_secs();
        parse_into(&lookup, "REQUEST_TIMEOUT_SECS", &mut secs);
        config.request_timeout = Duration::from_secs(secs);

        parse_into(&lookup, "BACKFILL_WINDOW_DAYS", &mut config.backfill_window_days);
        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        let mut secs = config.ws_ping_interval.as_secs();
        parse_into(&lookup, "WS_PING_INTERVAL_SECS", &mut secs);
        config.ws_ping_interval = Duration::from_secs(secs.max(1));

        if config.push_batch_limit == 0 {
            tracing::warn!("PUSH_BATCH_LIMIT must be positive, using 1");
            config.push_batch_limit = 1;
        }
        if config.lock_max_attempts == 0 {
            config.lock_max_attempts = 1;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `slot` with the parsed value of `key`, warning on bad input.
fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.push_batch_limit, 500);
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert!(config.push_gateway_url.is_none());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("PUSH_BATCH_LIMIT", "100"),
            ("LOCK_TTL_SECS", "5"),
            ("PUSH_GATEWAY_URL", "https://push.example.test/send"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.push_batch_limit, 100);
        assert_eq!(config.lock_ttl, Duration::from_secs(5));
        assert_eq!(
            config.push_gateway_url.as_deref(),
            Some("https://push.example.test/send")
        );
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("PUSH_QUEUE_CAPACITY", "lots"),
            ("PUSH_BATCH_LIMIT", "0"),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.push_queue_capacity, 1000);
        assert_eq!(config.push_batch_limit, 1);
    }
}
