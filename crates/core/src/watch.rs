//! Watch events, the event stream handle, and the list/watch contract a
//! transport implements for the reflector.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Object;

/// Version marker meaning "any recent state is fine, a cache may serve it".
pub const RESOURCE_VERSION_ANY: &str = "0";

/// Error object carried by a watch `Error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl Status {
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code, reason: reason.into(), message: message.into() }
    }

    pub fn gone(message: impl Into<String>) -> Self { Self::new(410, "Expired", message) }

    /// The requested version has been evicted from server-side history.
    pub fn is_gone(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, code {})", self.message, self.reason, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    /// Progress marker: the collection is known synced up to `resource_version`.
    Bookmark { resource_version: String },
    Error(Status),
    /// A kind the transport could not map; consumers skip it.
    Unrecognized { kind: String },
}

impl WatchEvent {
    pub fn kind(&self) -> &str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Bookmark { .. } => "BOOKMARK",
            WatchEvent::Error(_) => "ERROR",
            WatchEvent::Unrecognized { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    pub resource_version: String,
}

impl ListOptions {
    /// List at [`RESOURCE_VERSION_ANY`].
    pub fn any() -> Self { Self { resource_version: RESOURCE_VERSION_ANY.to_string() } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Deliver only changes strictly after this marker.
    pub resource_version: String,
    /// Hint for the server to close the stream after this long.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub items: Vec<Object>,
    pub resource_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ListWatchError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("too old resource version: {0}")]
    Gone(String),
    #[error("stream closed unexpectedly")]
    UnexpectedEof,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ListWatchError {
    pub fn is_connection_refused(&self) -> bool { matches!(self, ListWatchError::ConnectionRefused(_)) }
    pub fn is_gone(&self) -> bool { matches!(self, ListWatchError::Gone(_)) }

    /// Map the io error kinds the reflector treats specially.
    pub fn from_io(e: &io::Error) -> Option<Self> {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Some(ListWatchError::ConnectionRefused(e.to_string())),
            io::ErrorKind::UnexpectedEof => Some(ListWatchError::UnexpectedEof),
            _ => None,
        }
    }

    /// Walk a `source()` chain looking for an io error worth classifying.
    pub fn classify(err: &(dyn std::error::Error + 'static)) -> Option<Self> {
        let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = cur {
            if let Some(found) = e.downcast_ref::<io::Error>().and_then(Self::from_io) {
                return Some(found);
            }
            cur = e.source();
        }
        None
    }
}

/// Anything that can list a collection and watch it from a version marker.
#[async_trait]
pub trait ListerWatcher: Send + Sync {
    async fn list(&self, opts: ListOptions) -> Result<ListResult, ListWatchError>;

    /// Begin a watch strictly after `opts.resource_version`.
    async fn watch(&self, opts: WatchOptions) -> Result<WatchStream, ListWatchError>;
}

/// Consumer side of a watch: ordered events plus a stop handle.
///
/// Dropping the stream stops it.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
    stop: CancellationToken,
}

/// Producer side of a watch.
#[derive(Debug, Clone)]
pub struct WatchSender {
    tx: mpsc::Sender<WatchEvent>,
    stop: CancellationToken,
}

/// Stops a watch from any task. Idempotent.
#[derive(Debug, Clone)]
pub struct WatchStopper(CancellationToken);

impl WatchStream {
    pub fn channel(capacity: usize) -> (WatchSender, WatchStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stop = CancellationToken::new();
        (WatchSender { tx, stop: stop.clone() }, WatchStream { rx, stop })
    }

    /// Next event, or `None` once the producer is done or the stream was stopped.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        if self.stop.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            ev = self.rx.recv() => ev,
        }
    }

    pub fn stop(&self) { self.stop.cancel(); }
    pub fn is_stopped(&self) -> bool { self.stop.is_cancelled() }
    pub fn stopper(&self) -> WatchStopper { WatchStopper(self.stop.clone()) }

    pub fn into_stream(self) -> impl Stream<Item = WatchEvent> + Send {
        futures::stream::unfold(self, |mut w| async move { w.recv().await.map(|ev| (ev, w)) })
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) { self.stop.cancel(); }
}

impl WatchStopper {
    pub fn stop(&self) { self.0.cancel(); }
    pub fn is_stopped(&self) -> bool { self.0.is_cancelled() }
}

impl WatchSender {
    /// Deliver an event. Returns `false` once the consumer stopped or went away.
    pub async fn send(&self, ev: WatchEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            r = self.tx.send(ev) => r.is_ok(),
        }
    }

    pub fn is_stopped(&self) -> bool { self.stop.is_cancelled() || self.tx.is_closed() }

    /// Resolves when the consumer stops the stream or drops it.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn obj(rv: &str) -> Object {
        Object::new(json!({ "metadata": { "name": "a", "resourceVersion": rv } }))
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_close_with_producer() {
        let (tx, w) = WatchStream::channel(4);
        assert!(tx.send(WatchEvent::Added(obj("1"))).await);
        assert!(tx.send(WatchEvent::Modified(obj("2"))).await);
        drop(tx);
        let kinds: Vec<String> = w.into_stream().map(|e| e.kind().to_string()).collect().await;
        assert_eq!(kinds, vec!["ADDED", "MODIFIED"]);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_visible_to_producer() {
        let (tx, mut w) = WatchStream::channel(4);
        let stopper = w.stopper();
        let other = tokio::spawn(async move {
            stopper.stop();
            stopper.stop();
        });
        other.await.unwrap();
        w.stop();
        assert!(w.is_stopped());
        assert!(tx.is_stopped());
        assert!(!tx.send(WatchEvent::Added(obj("1"))).await);
        assert!(w.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_it() {
        let (tx, w) = WatchStream::channel(1);
        drop(w);
        tx.stopped().await;
        assert!(tx.is_stopped());
    }

    #[test]
    fn classify_finds_connection_refused_in_chain() {
        #[derive(Debug)]
        struct Wrapper(io::Error);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("request failed") }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { Some(&self.0) }
        }
        let e = Wrapper(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(ListWatchError::classify(&e).is_some_and(|c| c.is_connection_refused()));
        let eof = Wrapper(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(ListWatchError::classify(&eof), Some(ListWatchError::UnexpectedEof)));
        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(ListWatchError::classify(&other).is_none());
    }

    #[test]
    fn gone_status() {
        assert!(Status::gone("too old").is_gone());
        assert!(Status::new(500, "Gone", "x").is_gone());
        assert!(!Status::new(500, "InternalError", "x").is_gone());
    }
}
