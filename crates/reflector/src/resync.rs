use std::time::Duration;

use tokio::time::Instant;

/// Deadline of the next forced re-list, if periodic resync is enabled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResyncSchedule {
    deadline: Option<Instant>,
}

impl ResyncSchedule {
    /// A period too large to represent as a deadline means no resync.
    pub(crate) fn start(period: Duration, now: Instant) -> Self {
        let deadline = if period.is_zero() { None } else { now.checked_add(period) };
        Self { deadline }
    }

    pub(crate) fn until_due(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Resolves at the deadline; never resolves when resync is disabled.
    pub(crate) async fn due(&self) {
        match self.deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending().await,
        }
    }
}

/// Watch timeout: `min * (1 + jitter)` with `jitter` in `[0, 1]`, shortened to end
/// `threshold` before the next resync when that comes sooner.
pub(crate) fn watch_timeout(
    min: Duration,
    jitter: f64,
    until_resync: Option<Duration>,
    threshold: Duration,
) -> Duration {
    let extra = Duration::try_from_secs_f64(min.as_secs_f64() * jitter.clamp(0.0, 1.0)).unwrap_or(min);
    let random = min.saturating_add(extra);
    match until_resync.and_then(|r| r.checked_sub(threshold)) {
        Some(t) if !t.is_zero() && t < random => t,
        _ => random,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(300);
    const THRESHOLD: Duration = Duration::from_secs(1);

    #[test]
    fn timeout_spans_min_to_twice_min() {
        assert_eq!(watch_timeout(MIN, 0.0, None, THRESHOLD), MIN);
        assert_eq!(watch_timeout(MIN, 1.0, None, THRESHOLD), MIN * 2);
        assert_eq!(watch_timeout(MIN, 0.5, None, THRESHOLD), Duration::from_secs(450));
    }

    #[test]
    fn timeout_ends_before_a_close_resync() {
        let t = watch_timeout(MIN, 0.5, Some(Duration::from_secs(60)), THRESHOLD);
        assert_eq!(t, Duration::from_secs(59));
        // Far-away resync doesn't shorten anything.
        let t = watch_timeout(MIN, 0.0, Some(Duration::from_secs(3600)), THRESHOLD);
        assert_eq!(t, MIN);
        // Already inside the threshold: fall back to the random timeout.
        let t = watch_timeout(MIN, 0.0, Some(Duration::from_millis(500)), THRESHOLD);
        assert_eq!(t, MIN);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_deadline_and_force_window() {
        let now = Instant::now();
        let off = ResyncSchedule::start(Duration::ZERO, now);
        assert!(off.until_due(now).is_none());

        let on = ResyncSchedule::start(Duration::from_secs(10), now);
        assert_eq!(on.until_due(now), Some(Duration::from_secs(10)));
        assert_eq!(on.until_due(now + Duration::from_secs(4)), Some(Duration::from_secs(6)));

        on.due().await;
        assert!(Instant::now() >= now + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_periods_saturate_instead_of_panicking() {
        let huge = Duration::from_secs(u64::MAX / 2);
        let now = Instant::now();
        assert!(ResyncSchedule::start(huge, now).until_due(now).is_none());

        assert_eq!(watch_timeout(huge, 0.0, None, THRESHOLD), huge);
        assert!(watch_timeout(huge, 1.0, None, THRESHOLD) >= huge * 2);
        assert_eq!(watch_timeout(Duration::MAX, 1.0, None, THRESHOLD), Duration::MAX);
        assert!(watch_timeout(huge, 0.7, None, THRESHOLD) >= huge);
    }
}
