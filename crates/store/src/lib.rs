//! Orka store: keyed in-RAM mirror of a remote collection, with optional
//! secondary indices and change notifications for downstream consumers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use orka_core::{KeyError, Object};
use rustc_hash::FxHashMap;

mod cache;

pub use cache::Cache;

/// Derives the store key of an object.
pub type KeyFunc = Arc<dyn Fn(&Object) -> Result<String, KeyError> + Send + Sync>;

/// Computes the values an object is indexed under.
pub type IndexFunc = Arc<dyn Fn(&Object) -> Result<Vec<String>, KeyError> + Send + Sync>;

/// Index name -> index function.
pub type Indexers = FxHashMap<String, IndexFunc>;

/// Name of the namespace index installed by [`Cache::namespace_keyed`].
pub const NAMESPACE_INDEX: &str = "namespace";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("couldn't create key for object: {0}")]
    Key(#[from] KeyError),
    #[error("index with name {0} does not exist")]
    IndexNotFound(String),
    #[error("unable to calculate index entry for key {key:?} on index {index:?}: {source}")]
    Index {
        index: String,
        key: String,
        #[source]
        source: KeyError,
    },
}

/// Change notification. A full replace is reported as one `Replaced`, never
/// as a burst of per-key events, so consumers can tell a rebuild from a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Replaced { items: usize, resource_version: String },
    Added { key: String },
    Updated { key: String },
    Deleted { key: String },
}

/// Keyed container the reflector writes into.
pub trait Store: Send + Sync {
    /// Upsert by derived key.
    fn add(&self, obj: Object) -> Result<(), StoreError>;
    /// Upsert by derived key.
    fn update(&self, obj: Object) -> Result<(), StoreError>;
    /// Remove by derived key; absent keys are not an error.
    fn delete(&self, obj: &Object) -> Result<(), StoreError>;
    /// Point-in-time snapshot of all values, in no particular order.
    fn list(&self) -> Vec<Arc<Object>>;
    fn list_keys(&self) -> Vec<String>;
    fn get(&self, obj: &Object) -> Result<Option<Arc<Object>>, StoreError>;
    fn get_by_key(&self, key: &str) -> Option<Arc<Object>>;
    /// Atomically discard everything and install `items`.
    fn replace(&self, items: Vec<Object>, resource_version: &str) -> Result<(), StoreError>;
}

/// A store that also maintains named secondary indices.
pub trait Indexer: Store {
    /// Objects sharing any index value with `obj` on `index_name`.
    fn index(&self, index_name: &str, obj: &Object) -> Result<Vec<Arc<Object>>, StoreError>;
    fn index_keys(&self, index_name: &str, value: &str) -> Result<Vec<String>, StoreError>;
    fn list_index_func_values(&self, index_name: &str) -> Vec<String>;
    fn by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<Object>>, StoreError>;
    fn get_indexers(&self) -> Vec<String>;
}
