use std::env;
use std::time::Duration;

/// Runtime configuration parsed from environment variables.
///
/// Mirrors the env-var-with-typed-default style used across the platform's
/// other modules (`DATABASE_URL` required, everything else defaulted).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    pub max_event_queue_size: usize,
    pub max_events_per_stream: usize,
    pub max_connections_per_user: usize,

    pub cleanup_interval: Duration,
    pub heartbeat_interval: Duration,
    pub distributor_poll_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8095".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let max_event_queue_size = parse_env_or("MAX_EVENT_QUEUE_SIZE", 1000)?;
        let max_events_per_stream = parse_env_or("MAX_EVENTS_PER_STREAM", 100)?;
        let max_connections_per_user = parse_env_or("MAX_CONNECTIONS_PER_USER", 10)?;

        let cleanup_interval_secs: u64 = parse_env_or("CLEANUP_INTERVAL_SECS", 1800)?;
        let heartbeat_interval_secs: u64 = parse_env_or("HEARTBEAT_INTERVAL_SECS", 10)?;
        let distributor_poll_timeout_secs: u64 = parse_env_or("DISTRIBUTOR_POLL_TIMEOUT_SECS", 1)?;

        Ok(Config {
            database_url,
            host,
            port,
            max_event_queue_size,
            max_events_per_stream,
            max_connections_per_user,
            cleanup_interval: Duration::from_secs(cleanup_interval_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            distributor_poll_timeout: Duration::from_secs(distributor_poll_timeout_secs),
        })
    }
}

impl Default for Config {
    /// Defaults: 1000 / 100 / 10, 30 min cleanup, 10s heartbeat, 1s
    /// distributor poll. Used by tests that don't want to touch the
    /// environment.
    fn default() -> Self {
        Config {
            database_url: String::new(),
            host: "0.0.0.0".to_string(),
            port: 8095,
            max_event_queue_size: 1000,
            max_events_per_stream: 100,
            max_connections_per_user: 10,
            cleanup_interval: Duration::from_secs(1800),
            heartbeat_interval: Duration::from_secs(10),
            distributor_poll_timeout: Duration::from_secs(1),
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(v) => v.parse::<T>().map_err(|_| format!("{key} is not valid")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_event_queue_size, 1000);
        assert_eq!(cfg.max_events_per_stream, 100);
        assert_eq!(cfg.max_connections_per_user, 10);
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(1800));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.distributor_poll_timeout, Duration::from_secs(1));
    }
}
