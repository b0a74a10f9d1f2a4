//! Events published by collections and documents.

use crate::error::StoreError;

/// Published by a [`MirrorCollection`](crate::mirror::MirrorCollection).
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    /// A feed batch was applied. `ids` lists the current membership in order.
    Snapshot { ids: Vec<String> },
    /// The mirror was emptied ahead of a resubscription.
    Cleared,
    /// The change feed failed after its first snapshot. The mirror is no
    /// longer subscribed.
    SubscriptionFailed { error: StoreError },
}

/// Published by a [`MirrorDocument`](crate::mirror::MirrorDocument) after its
/// state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEvent {
    /// `update_local` or the optimistic half of `update` changed `data`.
    LocalEdit,
    /// A remote value arrived. `applied` is false when a pending local edit
    /// kept `data` unchanged.
    RemoteUpdate { applied: bool },
    /// A save or update was confirmed; the document is synced.
    Saved,
    /// The pending local edit was replaced by the latest remote value.
    Discarded,
    /// A failed `update` restored the previous value.
    RolledBack,
}
