//! Root of the mirror hierarchy.

use std::sync::Arc;

use crate::store::RemoteStore;

/// Something collections can be created under: the database root or a
/// document (for sub-collections).
pub trait MirrorParent: Send + Sync {
    /// Path prefix for child collections. Empty at the root.
    fn path(&self) -> String;

    fn store(&self) -> Arc<dyn RemoteStore>;
}

/// Entry point binding mirrors to one remote store.
#[derive(Clone)]
pub struct MirrorDatabase {
    store: Arc<dyn RemoteStore>,
}

impl MirrorDatabase {
    pub fn new(store: impl RemoteStore + 'static) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }
}

impl MirrorParent for MirrorDatabase {
    fn path(&self) -> String {
        String::new()
    }

    fn store(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.store)
    }
}

impl std::fmt::Debug for MirrorDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorDatabase").finish_non_exhaustive()
    }
}
