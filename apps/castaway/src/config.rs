use std::env;
use std::time::Duration;

use url::Url;

/// Client configuration.
///
/// Every duration here is an empirically-chosen knob (debounce lengths,
/// reconciliation windows, backoff shape), so all of them come from the
/// environment with defaults instead of living as constants next to the code
/// that uses them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Service base URL; push and HTTP endpoints are derived from it.
    pub server_url: Url,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub reconnect_ceiling: u32,
    /// Failed attempts before the user sees a connectivity advisory.
    pub advisory_threshold: u32,
    pub poll_interval: Duration,
    /// Quiet period a burst of mutations must survive before one command
    /// goes out.
    pub quiet_period: Duration,
    /// How long an optimistic edit may override the authoritative value.
    pub edit_window: Duration,
    pub seek_window: Duration,
    pub seek_tolerance_ms: u64,
    /// Cadence of the local playback-progress tick.
    pub render_tick: Duration,
    /// Where the preference file lives; `None` disables persistence.
    pub prefs_path: Option<std::path::PathBuf>,
}

impl Config {
    /// Load configuration from `CASTAWAY_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env::var("CASTAWAY_SERVER")
            .ok()
            .and_then(|raw| Url::parse(&raw).ok())
        {
            config.server_url = url;
        }
        config.reconnect_base = env_ms("CASTAWAY_RECONNECT_BASE_MS", config.reconnect_base);
        config.reconnect_cap = env_ms("CASTAWAY_RECONNECT_CAP_MS", config.reconnect_cap);
        config.reconnect_ceiling = env_u32("CASTAWAY_RECONNECT_CEILING", config.reconnect_ceiling);
        config.advisory_threshold =
            env_u32("CASTAWAY_ADVISORY_THRESHOLD", config.advisory_threshold);
        config.poll_interval = env_ms("CASTAWAY_POLL_INTERVAL_MS", config.poll_interval);
        config.quiet_period = env_ms("CASTAWAY_QUIET_PERIOD_MS", config.quiet_period);
        config.edit_window = env_ms("CASTAWAY_EDIT_WINDOW_MS", config.edit_window);
        config.seek_window = env_ms("CASTAWAY_SEEK_WINDOW_MS", config.seek_window);
        config.seek_tolerance_ms = env_u64("CASTAWAY_SEEK_TOLERANCE_MS", config.seek_tolerance_ms);
        config.render_tick = env_ms("CASTAWAY_RENDER_TICK_MS", config.render_tick);
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: Url::parse("http://127.0.0.1:8080/").expect("static url"),
            reconnect_base: Duration::from_millis(1_000),
            reconnect_cap: Duration::from_millis(20_000),
            reconnect_ceiling: 6,
            advisory_threshold: 4,
            poll_interval: Duration::from_millis(5_000),
            quiet_period: Duration::from_millis(120),
            edit_window: Duration::from_millis(5_000),
            seek_window: Duration::from_millis(4_000),
            seek_tolerance_ms: 600,
            render_tick: Duration::from_millis(1_000),
            prefs_path: crate::session::prefs::default_path(),
        }
    }
}

fn env_ms(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_u32(var: &str, default: u32) -> u32 {
    env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_u64(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
