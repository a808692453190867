use std::time::Duration;

/// Reflector timing knobs. Defaults suit a long-running mirror against a real server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectorConfig {
    /// Wait between the end of one list+watch iteration and the next.
    pub period: Duration,
    /// Forced full re-list interval. Zero disables periodic resync.
    pub resync_period: Duration,
    /// Watch timeouts are drawn uniformly from `[min, 2 * min]` to spread reconnects.
    pub min_watch_timeout: Duration,
    /// Watches are timed to end this long before the next planned resync.
    pub timeout_threshold: Duration,
    /// A watch that closes sooner than this with no events is reported as an error.
    pub short_watch_threshold: Duration,
    /// Pause before re-opening a watch the server refused to connect.
    pub connection_refused_backoff: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            resync_period: Duration::ZERO,
            min_watch_timeout: Duration::from_secs(5 * 60),
            timeout_threshold: Duration::from_secs(1),
            short_watch_threshold: Duration::from_secs(1),
            connection_refused_backoff: Duration::from_secs(1),
        }
    }
}

impl ReflectorConfig {
    /// Defaults overridden by `ORKA_*` environment variables.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let ms = |k: &str| get(k).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis);
        let secs = |k: &str| get(k).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs);
        let d = Self::default();
        Self {
            period: ms("ORKA_RELIST_PERIOD_MS").unwrap_or(d.period),
            resync_period: secs("ORKA_RESYNC_SECS").unwrap_or(d.resync_period),
            min_watch_timeout: secs("ORKA_MIN_WATCH_TIMEOUT_SECS").unwrap_or(d.min_watch_timeout),
            timeout_threshold: ms("ORKA_WATCH_TIMEOUT_THRESHOLD_MS").unwrap_or(d.timeout_threshold),
            short_watch_threshold: ms("ORKA_SHORT_WATCH_MS").unwrap_or(d.short_watch_threshold),
            connection_refused_backoff: ms("ORKA_WATCH_BACKOFF_MS").unwrap_or(d.connection_refused_backoff),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self { self.period = period; self }
    pub fn with_resync_period(mut self, resync_period: Duration) -> Self { self.resync_period = resync_period; self }
    pub fn with_min_watch_timeout(mut self, min: Duration) -> Self { self.min_watch_timeout = min; self }
    pub fn with_timeout_threshold(mut self, threshold: Duration) -> Self { self.timeout_threshold = threshold; self }
    pub fn with_short_watch_threshold(mut self, threshold: Duration) -> Self { self.short_watch_threshold = threshold; self }
    pub fn with_connection_refused_backoff(mut self, backoff: Duration) -> Self { self.connection_refused_backoff = backoff; self }
}
