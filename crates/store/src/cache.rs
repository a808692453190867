use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::{counter, gauge};
use orka_core::{meta_namespace_index, meta_namespace_key, Object};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::{IndexFunc, Indexer, Indexers, KeyFunc, Store, StoreError, StoreEvent, NAMESPACE_INDEX};

const EVENT_CAPACITY: usize = 1024;

struct Entry {
    obj: Arc<Object>,
    /// (index name, values) computed when the entry was stored.
    indexed: Vec<(String, Vec<String>)>,
}

#[derive(Default)]
struct Inner {
    items: FxHashMap<String, Entry>,
    /// index name -> value -> keys
    indices: FxHashMap<String, FxHashMap<String, BTreeSet<String>>>,
}

impl Inner {
    fn unindex(&mut self, key: &str, indexed: &[(String, Vec<String>)]) {
        for (name, values) in indexed {
            let Some(index) = self.indices.get_mut(name) else { continue };
            for v in values {
                if let Some(keys) = index.get_mut(v) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(v);
                    }
                }
            }
        }
    }

    fn reindex(&mut self, key: &str, indexed: &[(String, Vec<String>)]) {
        for (name, values) in indexed {
            let index = self.indices.entry(name.clone()).or_default();
            for v in values {
                index.entry(v.clone()).or_default().insert(key.to_string());
            }
        }
    }

    fn keys_for(&self, index_name: &str, value: &str) -> Vec<String> {
        self.indices
            .get(index_name)
            .and_then(|idx| idx.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Thread-safe keyed cache implementing [`Store`] and [`Indexer`].
///
/// Every single-key mutation and every `replace` happens under one write
/// guard, so readers never observe a torn key or a half-replaced map.
pub struct Cache {
    key_fn: KeyFunc,
    indexers: Indexers,
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
    epoch: watch::Sender<u64>,
}

impl Default for Cache {
    fn default() -> Self { Self::new() }
}

impl Cache {
    /// Cache keyed by `namespace/name`, without indices.
    pub fn new() -> Self { Self::with_indexers(Arc::new(meta_namespace_key), Indexers::default()) }

    pub fn with_key_func(key_fn: KeyFunc) -> Self { Self::with_indexers(key_fn, Indexers::default()) }

    pub fn with_indexers(key_fn: KeyFunc, indexers: Indexers) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (epoch, _) = watch::channel(0u64);
        Self { key_fn, indexers, inner: RwLock::new(Inner::default()), events, epoch }
    }

    /// Cache keyed by `namespace/name` with a [`NAMESPACE_INDEX`] index.
    pub fn namespace_keyed() -> Self {
        let mut indexers = Indexers::default();
        indexers.insert(NAMESPACE_INDEX.to_string(), Arc::new(meta_namespace_index) as IndexFunc);
        Self::with_indexers(Arc::new(meta_namespace_key), indexers)
    }

    pub fn len(&self) -> usize { self.read().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Subscribe to change notifications. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> { self.events.subscribe() }

    /// Epoch counter bumped after every mutation, including replaces.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch.subscribe() }

    pub fn epoch(&self) -> u64 { *self.epoch.borrow() }

    fn read(&self) -> RwLockReadGuard<'_, Inner> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, Inner> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    fn index_values(&self, key: &str, obj: &Object) -> Result<Vec<(String, Vec<String>)>, StoreError> {
        let mut out = Vec::with_capacity(self.indexers.len());
        for (name, f) in self.indexers.iter() {
            let values = f(obj).map_err(|source| StoreError::Index { index: name.clone(), key: key.to_string(), source })?;
            out.push((name.clone(), values));
        }
        Ok(out)
    }

    fn publish(&self, ev: StoreEvent, len: usize) {
        // No receivers is fine.
        let _ = self.events.send(ev);
        self.epoch.send_modify(|e| *e = e.wrapping_add(1));
        gauge!("store_items", len as f64);
    }

    fn upsert(&self, obj: Object) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        let indexed = self.index_values(&key, &obj)?;
        let mut inner = self.write();
        let old = inner.items.remove(&key);
        if let Some(old) = &old {
            inner.unindex(&key, &old.indexed);
        }
        inner.reindex(&key, &indexed);
        inner.items.insert(key.clone(), Entry { obj: Arc::new(obj), indexed });
        let len = inner.items.len();
        let ev = if old.is_some() { StoreEvent::Updated { key } } else { StoreEvent::Added { key } };
        self.publish(ev, len);
        Ok(())
    }
}

impl Store for Cache {
    fn add(&self, obj: Object) -> Result<(), StoreError> { self.upsert(obj) }

    fn update(&self, obj: Object) -> Result<(), StoreError> { self.upsert(obj) }

    fn delete(&self, obj: &Object) -> Result<(), StoreError> {
        let key = (self.key_fn)(obj)?;
        let mut inner = self.write();
        let Some(old) = inner.items.remove(&key) else { return Ok(()) };
        inner.unindex(&key, &old.indexed);
        let len = inner.items.len();
        self.publish(StoreEvent::Deleted { key }, len);
        Ok(())
    }

    fn list(&self) -> Vec<Arc<Object>> {
        self.read().items.values().map(|e| Arc::clone(&e.obj)).collect()
    }

    fn list_keys(&self) -> Vec<String> { self.read().items.keys().cloned().collect() }

    fn get(&self, obj: &Object) -> Result<Option<Arc<Object>>, StoreError> {
        let key = (self.key_fn)(obj)?;
        Ok(self.get_by_key(&key))
    }

    fn get_by_key(&self, key: &str) -> Option<Arc<Object>> {
        self.read().items.get(key).map(|e| Arc::clone(&e.obj))
    }

    fn replace(&self, items: Vec<Object>, resource_version: &str) -> Result<(), StoreError> {
        // Build the whole replacement first; a bad item leaves the current contents alone.
        let mut next = Inner::default();
        for obj in items {
            let key = (self.key_fn)(&obj)?;
            let indexed = self.index_values(&key, &obj)?;
            if let Some(old) = next.items.remove(&key) {
                next.unindex(&key, &old.indexed);
            }
            next.reindex(&key, &indexed);
            next.items.insert(key, Entry { obj: Arc::new(obj), indexed });
        }
        let len = next.items.len();
        {
            let mut inner = self.write();
            *inner = next;
            self.publish(StoreEvent::Replaced { items: len, resource_version: resource_version.to_string() }, len);
        }
        counter!("store_replaces_total", 1u64);
        debug!(items = len, resource_version = %resource_version, "store replaced");
        Ok(())
    }
}

impl Indexer for Cache {
    fn index(&self, index_name: &str, obj: &Object) -> Result<Vec<Arc<Object>>, StoreError> {
        let f = self.indexers.get(index_name).ok_or_else(|| StoreError::IndexNotFound(index_name.to_string()))?;
        let values = f(obj).map_err(|source| StoreError::Index {
            index: index_name.to_string(),
            key: obj.name().unwrap_or_default().to_string(),
            source,
        })?;
        let inner = self.read();
        let mut keys: BTreeSet<String> = BTreeSet::new();
        for v in values.iter() {
            keys.extend(inner.keys_for(index_name, v));
        }
        Ok(keys.iter().filter_map(|k| inner.items.get(k)).map(|e| Arc::clone(&e.obj)).collect())
    }

    fn index_keys(&self, index_name: &str, value: &str) -> Result<Vec<String>, StoreError> {
        if !self.indexers.contains_key(index_name) {
            return Err(StoreError::IndexNotFound(index_name.to_string()));
        }
        Ok(self.read().keys_for(index_name, value))
    }

    fn list_index_func_values(&self, index_name: &str) -> Vec<String> {
        self.read().indices.get(index_name).map(|idx| idx.keys().cloned().collect()).unwrap_or_default()
    }

    fn by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<Object>>, StoreError> {
        if !self.indexers.contains_key(index_name) {
            return Err(StoreError::IndexNotFound(index_name.to_string()));
        }
        let inner = self.read();
        let keys = inner.keys_for(index_name, value);
        Ok(keys.iter().filter_map(|k| inner.items.get(k)).map(|e| Arc::clone(&e.obj)).collect())
    }

    fn get_indexers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexers.keys().cloned().collect();
        names.sort();
        names
    }
}
