//! Process-level configuration read from the environment.
//!
//! Component configs (`BusConfig`, `RiskLimits`, `ExecConfig`, ...) live next
//! to their components and follow the same `from_env()` pattern.

use std::path::PathBuf;

/// Parse `key` from the environment, falling back to `default` when unset
/// or unparsable.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => default,
    }
}

/// Where data comes from and where results go.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory of `<SYMBOL>.csv` bar files.
    pub data_dir: PathBuf,
    pub sqlite_path: String,
    /// Events held in memory ahead of the replay cursor.
    pub lookahead: usize,
    /// Missing bars forward-filled before a gap is fatal.
    pub gap_fill_tolerance: u64,
    pub bar_interval_ms: u64,
    pub reference_symbol: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string())),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./replayfx.sqlite".to_string()),
            lookahead: env_or("LOOKAHEAD", 256),
            gap_fill_tolerance: env_or("GAP_FILL_TOLERANCE", 2),
            bar_interval_ms: env_or("BAR_INTERVAL_MS", 60_000),
            reference_symbol: std::env::var("REFERENCE_SYMBOL").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn csv_path(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{symbol}.csv"))
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self {
            workers: env_or("WORKERS", num_cpus::get()).max(1),
            queue_capacity: env_or("JOB_QUEUE_CAP", 64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: String,
    pub ws_addr: String,
    /// Live tick feed for paper trading.
    pub feed_url: Option<String>,
    /// REST base for historical bars, when not reading CSVs.
    pub history_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            http_addr: std::env::var("HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            ws_addr: std::env::var("WS_ADDR").unwrap_or_else(|_| "127.0.0.1:8081".to_string()),
            feed_url: std::env::var("FEED_URL").ok(),
            history_url: std::env::var("HISTORY_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("REPLAYFX_TEST_NUM", "not-a-number");
        assert_eq!(env_or("REPLAYFX_TEST_NUM", 7u64), 7);
        std::env::set_var("REPLAYFX_TEST_NUM", "12");
        assert_eq!(env_or("REPLAYFX_TEST_NUM", 7u64), 12);
        std::env::remove_var("REPLAYFX_TEST_NUM");
    }

    #[test]
    fn csv_path_uses_symbol() {
        let mut cfg = EngineConfig::from_env();
        cfg.data_dir = PathBuf::from("/tmp/bars");
        assert_eq!(cfg.csv_path("BTCUSDT"), PathBuf::from("/tmp/bars/BTCUSDT.csv"));
    }
}
