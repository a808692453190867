use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use orka_core::{
    ExpectedType, ListOptions, ListResult, ListWatchError, ListerWatcher, Object, WatchEvent,
    WatchOptions, WatchStream,
};
use orka_store::{Cache, Store};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReflectorConfig;
use crate::resync::{watch_timeout, ResyncSchedule};
use crate::version::LastSyncedVersion;
use crate::ReflectorError;

/// How one list+watch iteration ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server ended the stream.
    Closed { events: usize },
    /// The local watch deadline passed before the server closed the stream.
    TimedOut { events: usize },
    /// Periodic resync is due; the caller should re-list.
    ResyncRequested,
    /// The stop signal fired.
    StopRequested,
}

enum Mutation {
    Add,
    Update,
    Delete,
}

/// Keeps a [`Store`] in sync with a remote collection: list once, replace the
/// store, then stream watch events into it until the watch ends, and repeat.
pub struct Reflector {
    name: String,
    expected_type: ExpectedType,
    store: Arc<dyn Store>,
    lister_watcher: Arc<dyn ListerWatcher>,
    config: ReflectorConfig,
    last_sync: LastSyncedVersion,
}

/// A namespace-indexed cache plus a reflector feeding it.
pub fn new_namespace_keyed_indexer_and_reflector(
    name: impl Into<String>,
    lister_watcher: Arc<dyn ListerWatcher>,
    expected_type: ExpectedType,
    resync_period: Duration,
) -> (Arc<Cache>, Reflector) {
    let indexer = Arc::new(Cache::namespace_keyed());
    let store: Arc<dyn Store> = indexer.clone();
    let config = ReflectorConfig::default().with_resync_period(resync_period);
    (indexer, Reflector::new(name, lister_watcher, expected_type, store, config))
}

impl Reflector {
    pub fn new(
        name: impl Into<String>,
        lister_watcher: Arc<dyn ListerWatcher>,
        expected_type: ExpectedType,
        store: Arc<dyn Store>,
        config: ReflectorConfig,
    ) -> Self {
        Self {
            name: name.into(),
            expected_type,
            store,
            lister_watcher,
            config,
            last_sync: LastSyncedVersion::default(),
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn expected_type(&self) -> &ExpectedType { &self.expected_type }
    pub fn config(&self) -> &ReflectorConfig { &self.config }

    /// Resource version observed at the last store sync. Eventually consistent.
    pub fn last_sync_resource_version(&self) -> String { self.last_sync.get() }

    /// Shareable read handle for the last synced version.
    pub fn version_handle(&self) -> LastSyncedVersion { self.last_sync.clone() }

    /// Run forever on a background task.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> { self.run_until(CancellationToken::new()) }

    /// Run on a background task until `stop` fires. Returns immediately.
    pub fn run_until(self: Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(reflector = %self.name, expected = %self.expected_type, "reflector started");
            loop {
                match self.list_and_watch(&stop).await {
                    Ok(SessionEnd::StopRequested) => break,
                    Ok(end) => debug!(reflector = %self.name, end = ?end, "list and watch finished"),
                    Err(e) => {
                        counter!("reflector_errors_total", 1, "reflector" => self.name.clone());
                        warn!(reflector = %self.name, expected = %self.expected_type, error = %e, "list and watch failed");
                    }
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = sleep(self.config.period) => {}
                }
            }
            info!(reflector = %self.name, "reflector stopped");
        })
    }

    /// One iteration: list, replace the store, then watch from the listed version
    /// until the watch ends.
    pub async fn list_and_watch(&self, stop: &CancellationToken) -> Result<SessionEnd, ReflectorError> {
        let t0 = Instant::now();
        let listed = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(SessionEnd::StopRequested),
            r = self.lister_watcher.list(ListOptions::any()) => r,
        };
        let ListResult { items, resource_version } = listed.map_err(|e| {
            counter!("reflector_list_errors_total", 1, "reflector" => self.name.clone());
            ReflectorError::List(e)
        })?;
        counter!("reflector_lists_total", 1, "reflector" => self.name.clone());
        histogram!("reflector_list_ms", t0.elapsed().as_secs_f64() * 1000.0, "reflector" => self.name.clone());

        let count = items.len();
        self.store.replace(items, &resource_version).map_err(ReflectorError::Sync)?;
        self.last_sync.set(&resource_version);
        gauge!("reflector_items", count as f64, "reflector" => self.name.clone());
        debug!(reflector = %self.name, items = count, resource_version = %resource_version, "list synced");

        let mut resource_version = resource_version;
        let resync = ResyncSchedule::start(self.config.resync_period, Instant::now());
        loop {
            let now = Instant::now();
            let timeout = self.timeout_for_watch(&resync, now);
            let opts = WatchOptions { resource_version: resource_version.clone(), timeout: Some(timeout) };
            let opened = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(SessionEnd::StopRequested),
                r = self.lister_watcher.watch(opts) => r,
            };
            let w = match opened {
                Ok(w) => w,
                Err(ListWatchError::UnexpectedEof) => {
                    debug!(reflector = %self.name, "watch closed with unexpected eof");
                    return Ok(SessionEnd::Closed { events: 0 });
                }
                Err(e) if e.is_connection_refused() => {
                    // Listed state is still valid: retry from the same version.
                    error!(reflector = %self.name, error = %e, "failed to watch");
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(SessionEnd::StopRequested),
                        _ = sleep(self.config.connection_refused_backoff) => continue,
                    }
                }
                Err(e) => {
                    error!(reflector = %self.name, expected = %self.expected_type, error = %e, "failed to watch");
                    return Err(ReflectorError::WatchOpen(e));
                }
            };
            counter!("reflector_watches_total", 1, "reflector" => self.name.clone());
            return self.watch_handler(w, &mut resource_version, &resync, now.checked_add(timeout), stop).await;
        }
    }

    fn timeout_for_watch(&self, resync: &ResyncSchedule, now: Instant) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        watch_timeout(self.config.min_watch_timeout, jitter, resync.until_due(now), self.config.timeout_threshold)
    }

    /// Drain `w` into the store until it closes, times out, or stop/resync fires.
    /// A `None` deadline leaves the timeout to the server.
    /// `w` is stopped when dropped, so every return path releases it.
    async fn watch_handler(
        &self,
        mut w: WatchStream,
        resource_version: &mut String,
        resync: &ResyncSchedule,
        watch_deadline: Option<Instant>,
        stop: &CancellationToken,
    ) -> Result<SessionEnd, ReflectorError> {
        let start = Instant::now();
        let mut events = 0usize;
        let resync_due = resync.due();
        tokio::pin!(resync_due);
        let timed_out = async move {
            match watch_deadline {
                Some(d) => sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timed_out);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(SessionEnd::StopRequested),
                _ = &mut resync_due => {
                    debug!(reflector = %self.name, events, "resync due, ending watch");
                    return Ok(SessionEnd::ResyncRequested);
                }
                _ = &mut timed_out => {
                    debug!(reflector = %self.name, events, "watch deadline reached");
                    return Ok(SessionEnd::TimedOut { events });
                }
                ev = w.recv() => {
                    let Some(ev) = ev else { break };
                    if self.handle_event(ev, resource_version)? {
                        events += 1;
                    }
                }
            }
        }

        let elapsed = start.elapsed();
        if elapsed < self.config.short_watch_threshold && events == 0 {
            counter!("reflector_short_watches_total", 1, "reflector" => self.name.clone());
            debug!(reflector = %self.name, elapsed_ms = %elapsed.as_millis(), "unexpected watch close, no items received");
            return Err(ReflectorError::VeryShortWatch { elapsed });
        }
        debug!(reflector = %self.name, expected = %self.expected_type, events, "watch closed");
        Ok(SessionEnd::Closed { events })
    }

    /// Apply one event. `Ok(false)` means it was skipped.
    fn handle_event(&self, ev: WatchEvent, resource_version: &mut String) -> Result<bool, ReflectorError> {
        let (mutation, obj) = match ev {
            WatchEvent::Added(obj) => (Mutation::Add, obj),
            WatchEvent::Modified(obj) => (Mutation::Update, obj),
            WatchEvent::Deleted(obj) => (Mutation::Delete, obj),
            WatchEvent::Error(status) => return Err(ReflectorError::WatchEvent(status)),
            WatchEvent::Bookmark { resource_version: rv } => {
                self.last_sync.set(&rv);
                *resource_version = rv;
                return Ok(true);
            }
            WatchEvent::Unrecognized { kind } => {
                counter!("reflector_event_errors_total", 1, "reflector" => self.name.clone());
                error!(reflector = %self.name, kind = %kind, "unable to understand watch event");
                return Ok(false);
            }
        };

        if !self.expected_type.matches(&obj) {
            counter!("reflector_event_errors_total", 1, "reflector" => self.name.clone());
            let got = obj.type_tag().map(|t| t.to_string()).unwrap_or_else(|| "<none>".to_string());
            error!(reflector = %self.name, expected = %self.expected_type, got = %got, "watch event object has unexpected type");
            return Ok(false);
        }
        let new_rv = obj.resource_version().filter(|rv| !rv.is_empty()).map(str::to_string);
        if let Err(e) = self.apply(mutation, obj) {
            counter!("reflector_event_errors_total", 1, "reflector" => self.name.clone());
            error!(reflector = %self.name, error = %e, "unable to apply watch event");
            return Ok(false);
        }
        // Without a version the mutation still lands; the resume point stays put.
        match new_rv {
            Some(rv) => {
                self.last_sync.set(&rv);
                *resource_version = rv;
            }
            None => warn!(reflector = %self.name, "watch event object has no resourceVersion"),
        }
        counter!("reflector_watch_events_total", 1, "reflector" => self.name.clone());
        Ok(true)
    }

    fn apply(&self, mutation: Mutation, obj: Object) -> Result<(), orka_store::StoreError> {
        match mutation {
            Mutation::Add => self.store.add(obj),
            Mutation::Update => self.store.update(obj),
            Mutation::Delete => self.store.delete(&obj),
        }
    }
}
