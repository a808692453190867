#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use orka_core::{
    ListOptions, ListResult, ListWatchError, ListerWatcher, Object, WatchOptions, WatchSender, WatchStream,
};

/// Scripted lister/watcher: each call pops the next scripted response.
/// An exhausted script blocks forever, like a server that never answers.
#[derive(Default)]
pub struct FakeListerWatcher {
    lists: Mutex<VecDeque<Result<ListResult, ListWatchError>>>,
    watches: Mutex<VecDeque<Result<WatchStream, ListWatchError>>>,
    list_calls: Mutex<Vec<ListOptions>>,
    watch_calls: Mutex<Vec<WatchOptions>>,
}

impl FakeListerWatcher {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn push_list(&self, items: Vec<Object>, rv: &str) {
        self.lists.lock().unwrap().push_back(Ok(ListResult { items, resource_version: rv.to_string() }));
    }

    pub fn push_list_err(&self, e: ListWatchError) { self.lists.lock().unwrap().push_back(Err(e)); }

    /// Script a successful watch; the returned sender feeds it.
    pub fn push_watch(&self) -> WatchSender {
        let (tx, w) = WatchStream::channel(16);
        self.watches.lock().unwrap().push_back(Ok(w));
        tx
    }

    pub fn push_watch_err(&self, e: ListWatchError) { self.watches.lock().unwrap().push_back(Err(e)); }

    pub fn list_calls(&self) -> Vec<ListOptions> { self.list_calls.lock().unwrap().clone() }
    pub fn watch_calls(&self) -> Vec<WatchOptions> { self.watch_calls.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl ListerWatcher for FakeListerWatcher {
    async fn list(&self, opts: ListOptions) -> Result<ListResult, ListWatchError> {
        self.list_calls.lock().unwrap().push(opts);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => std::future::pending().await,
        }
    }

    async fn watch(&self, opts: WatchOptions) -> Result<WatchStream, ListWatchError> {
        self.watch_calls.lock().unwrap().push(opts);
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => std::future::pending().await,
        }
    }
}

pub fn obj(name: &str, rv: &str) -> Object { typed("v1", "ConfigMap", name, rv) }

pub fn typed(api_version: &str, kind: &str, name: &str, rv: &str) -> Object {
    Object::new(serde_json::json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "namespace": "ns", "name": name, "resourceVersion": rv },
    }))
}

/// Sorted `(key, resourceVersion)` view of a store.
pub fn canon(store: &dyn orka_store::Store) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = store
        .list()
        .iter()
        .map(|o| {
            (
                orka_core::meta_namespace_key(o).unwrap_or_default(),
                o.resource_version().unwrap_or_default().to_string(),
            )
        })
        .collect();
    out.sort_unstable();
    out
}

/// Poll `cond` on the (possibly paused) tokio clock.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
