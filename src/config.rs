use chrono::FixedOffset;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::{LogFormat, LoggingConfig};
use crate::scheduler::FireHours;

pub const DEFAULT_RATES_URL: &str = "https://m-lombard.kz/ru/api/admin/purities/?format=json";

pub const CACHE_FILE: &str = "rates_cache.json";

pub const DEFAULT_FIRE_HOURS: [u32; 3] = [9, 12, 18];

/// A board older than this is flagged as stale.
pub const STALE_AFTER_HOURS: i64 = 12;

pub const HTTP_TIMEOUT_SECS: u64 = 15;

/// Board timestamps are shown in the shop's zone (Kazakhstan, UTC+5), not the
/// host's.
pub const DEFAULT_DISPLAY_OFFSET: &str = "+05:00";

/// Runtime settings. Every flag can also be given through the environment
/// (a `.env` file is loaded first).
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Endpoint returning a JSON array of `{code, label, price}` records
    #[arg(long, env = "RATES_URL", default_value = DEFAULT_RATES_URL)]
    pub rates_url: String,

    /// File holding the current and previous rate generations
    #[arg(long, env = "RATES_CACHE_FILE", default_value = CACHE_FILE)]
    pub cache_file: PathBuf,

    /// Local hours at which the board refreshes, e.g. "9,12,18"
    #[arg(long, env = "FIRE_HOURS", default_value = "9,12,18")]
    pub fire_hours: FireHours,

    /// Request timeout for the rate source, in seconds
    #[arg(long = "http-timeout", env = "HTTP_TIMEOUT_SECS", default_value_t = HTTP_TIMEOUT_SECS)]
    pub http_timeout_secs: u64,

    /// UTC offset used when printing board timestamps, e.g. "+05:00"
    #[arg(long, env = "DISPLAY_UTC_OFFSET", default_value = DEFAULT_DISPLAY_OFFSET)]
    pub display_offset: FixedOffset,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Settings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: self.log_format,
        }
    }
}
