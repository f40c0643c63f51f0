use tracing::warn;

use crate::Interval;

/// All configuration loaded from environment variables at startup.
/// Every variable is optional; an unparseable interval causes an immediate
/// panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Exchange endpoints
    pub rest_url: String,
    pub ws_url: String,

    // Market data
    pub interval: Interval,
    pub window_capacity: usize,
    pub reconcile_interval_secs: u64,

    // Stream transport
    pub reconnect_backoff_secs: u64,
    pub max_connect_attempts: u32,
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub inbound_queue_capacity: usize,

    // REST rate limiting
    pub rest_rate_limit: u32,
    pub rest_rate_window_secs: u64,

    // Strategy config file path
    pub strategy_config_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rest_url: "https://api.bybit.com".to_string(),
            ws_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
            interval: Interval::default(),
            window_capacity: 150,
            reconcile_interval_secs: 3_600,
            reconnect_backoff_secs: 5,
            max_connect_attempts: 5,
            ping_interval_secs: 20,
            read_timeout_secs: 60,
            ack_timeout_secs: 10,
            inbound_queue_capacity: 1_000,
            rest_rate_limit: 600,
            rest_rate_window_secs: 5,
            strategy_config_path: "config/strategies.toml".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    /// Loads `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let defaults = Config::default();

        let interval = match optional_env("DEFAULT_INTERVAL") {
            Some(raw) => Interval::parse(&raw)
                .unwrap_or_else(|e| panic!("ERROR: DEFAULT_INTERVAL is invalid: {e}")),
            None => defaults.interval,
        };

        Config {
            rest_url: optional_env("BYBIT_REST_URL").unwrap_or(defaults.rest_url),
            ws_url: optional_env("BYBIT_WS_URL").unwrap_or(defaults.ws_url),
            interval,
            window_capacity: parsed_env("WINDOW_CAPACITY", defaults.window_capacity),
            reconcile_interval_secs: parsed_env(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
            reconnect_backoff_secs: parsed_env(
                "RECONNECT_BACKOFF_SECS",
                defaults.reconnect_backoff_secs,
            ),
            max_connect_attempts: parsed_env("MAX_CONNECT_ATTEMPTS", defaults.max_connect_attempts),
            ping_interval_secs: parsed_env("PING_INTERVAL_SECS", defaults.ping_interval_secs),
            read_timeout_secs: parsed_env("READ_TIMEOUT_SECS", defaults.read_timeout_secs),
            ack_timeout_secs: parsed_env("ACK_TIMEOUT_SECS", defaults.ack_timeout_secs),
            inbound_queue_capacity: parsed_env(
                "INBOUND_QUEUE_CAPACITY",
                defaults.inbound_queue_capacity,
            ),
            rest_rate_limit: parsed_env("REST_RATE_LIMIT", defaults.rest_rate_limit),
            rest_rate_window_secs: parsed_env(
                "REST_RATE_WINDOW_SECS",
                defaults.rest_rate_window_secs,
            ),
            strategy_config_path: optional_env("STRATEGY_CONFIG_PATH")
                .unwrap_or(defaults.strategy_config_path),
        }
    }
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match optional_env(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparsable environment value, using default");
            default
        }),
        None => default,
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
