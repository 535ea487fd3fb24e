use chrono::{Datelike, Utc};
use clap::Parser;
use std::time::Duration;

use crate::ingest::{BackoffPolicy, SubscriberOptions, SyncOptions};
use crate::provider::squiggle::normalize_base_url;

/// AFL fixture synchroniser: keeps a local store in step with the provider
#[derive(Parser, Debug, Clone)]
#[command(name = "fixture-sync", version, about)]
pub struct Config {
    /// Provider API base URL (REST queries and the event stream)
    #[arg(long, env = "PROVIDER_URL", default_value = "https://api.squiggle.com.au")]
    pub provider_url: String,

    /// User-Agent sent with every request; the provider asks for contact details
    #[arg(
        long,
        env = "USER_AGENT",
        default_value = concat!("fixture-sync/", env!("CARGO_PKG_VERSION"))
    )]
    pub user_agent: String,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "fixtures.db")]
    pub database_path: String,

    /// Season to bulk-sync (defaults to the current year)
    #[arg(long, env = "SYNC_YEAR")]
    pub sync_year: Option<i32>,

    /// Run a bulk sync once at startup
    #[arg(
        long,
        env = "SYNC_ON_START",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub sync_on_start: bool,

    /// Periodic bulk refresh interval in seconds (0 disables)
    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value = "3600")]
    pub sync_interval_secs: u64,

    /// Timeout for a single REST request
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "10")]
    pub request_timeout_secs: u64,

    /// First reconnect delay for the event stream
    #[arg(long, env = "BACKOFF_BASE_SECS", default_value = "5")]
    pub backoff_base_secs: u64,

    /// Ceiling for the reconnect delay
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value = "300")]
    pub backoff_max_secs: u64,

    /// Consecutive failed reconnects before the subscription gives up
    #[arg(long, env = "MAX_RETRIES", default_value = "5")]
    pub max_retries: u32,

    /// Reconnect when the stream is silent this long (0 disables)
    #[arg(long, env = "STREAM_IDLE_TIMEOUT_SECS", default_value = "0")]
    pub stream_idle_timeout_secs: u64,

    /// Earliest season the year fallback may reach
    #[arg(long, env = "MIN_SEASON_YEAR", default_value = "1897")]
    pub min_season_year: i32,

    /// Seasons the bulk sync may step back when a year has no completed round
    #[arg(long, env = "MAX_YEAR_FALLBACK", default_value = "3")]
    pub max_year_fallback: u32,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        normalize_base_url(&self.provider_url)?;
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent must not be empty");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be positive");
        }
        if self.backoff_base_secs == 0 {
            anyhow::bail!("backoff_base_secs must be positive");
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            anyhow::bail!(
                "backoff_max_secs ({}) must not be below backoff_base_secs ({})",
                self.backoff_max_secs,
                self.backoff_base_secs
            );
        }
        if self.min_season_year > self.sync_year() {
            anyhow::bail!(
                "min_season_year ({}) is after sync year ({})",
                self.min_season_year,
                self.sync_year()
            );
        }
        Ok(())
    }

    pub fn sync_year(&self) -> i32 {
        self.sync_year.unwrap_or_else(|| Utc::now().year())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.backoff_base_secs),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            backoff: self.backoff(),
            idle_timeout: (self.stream_idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.stream_idle_timeout_secs)),
            ..SubscriberOptions::default()
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            min_season_year: self.min_season_year,
            max_year_fallback: self.max_year_fallback,
        }
    }
}
