use std::sync::Arc;

use arc_swap::ArcSwap;

/// Last resource version the reflector synced its store to.
///
/// Cheap to clone and safe to read from any task. Not synchronized with the
/// store itself: a reader may see a version one event ahead of or behind the
/// store contents.
#[derive(Debug, Clone)]
pub struct LastSyncedVersion(Arc<ArcSwap<String>>);

impl Default for LastSyncedVersion {
    fn default() -> Self { Self(Arc::new(ArcSwap::from_pointee(String::new()))) }
}

impl LastSyncedVersion {
    pub fn get(&self) -> String { self.0.load().as_ref().clone() }

    pub(crate) fn set(&self, rv: &str) { self.0.store(Arc::new(rv.to_string())); }
}
