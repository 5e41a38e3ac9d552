//! envwatch store: folds a baseline listing and watch events into collection snapshots.

#![forbid(unsafe_code)]

use std::sync::Arc;

use envwatch_core::{Collection, FetchError, KindTag, Resource, WatchEvent};

mod hub;
mod live;

pub use hub::LiveHub;
pub use live::{LiveCollection, LiveConfig};

/// Apply one watch event to `items`. Returns whether the collection changed.
///
/// Added/Modified upsert by name (position preserved on update, append otherwise);
/// Deleted removes every element carrying that name; Error is a no-op.
pub fn apply_event(items: &mut Vec<Arc<Resource>>, ev: WatchEvent) -> bool {
    match ev {
        WatchEvent::Added(r) | WatchEvent::Modified(r) => upsert(items, r),
        WatchEvent::Deleted(r) => {
            let before = items.len();
            items.retain(|x| x.name != r.name);
            items.len() != before
        }
        WatchEvent::Error(_) => false,
    }
}

fn upsert(items: &mut Vec<Arc<Resource>>, r: Resource) -> bool {
    if let Some(idx) = items.iter().position(|x| x.name == r.name) {
        if *items[idx] == r {
            return false;
        }
        items[idx] = Arc::new(r);
    } else {
        items.push(Arc::new(r));
    }
    true
}

/// Builds [`Collection`] snapshots for one (kind, namespace) pair.
pub struct CollectionBuilder {
    kind: KindTag,
    namespace: String,
    epoch: u64,
    items: Vec<Arc<Resource>>,
    fetch_error: Option<FetchError>,
}

impl CollectionBuilder {
    pub fn new(kind: KindTag, namespace: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), epoch: 0, items: Vec::new(), fetch_error: None }
    }

    pub fn epoch(&self) -> u64 { self.epoch }

    /// Replace the contents with a fresh listing. Duplicate names collapse onto the first slot.
    pub fn baseline(&mut self, listed: Vec<Resource>) {
        self.items.clear();
        for r in listed {
            upsert(&mut self.items, r);
        }
        self.fetch_error = None;
        self.epoch = self.epoch.saturating_add(1);
    }

    /// The listing failed: start empty and remember why.
    pub fn baseline_failed(&mut self, err: FetchError) {
        self.items.clear();
        self.fetch_error = Some(err);
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Apply a batch of events in order. Returns how many changed the collection.
    pub fn apply(&mut self, batch: Vec<WatchEvent>) -> usize {
        let mut changed = 0usize;
        for ev in batch {
            if apply_event(&mut self.items, ev) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.epoch = self.epoch.saturating_add(1);
        }
        changed
    }

    pub fn freeze(&self) -> Arc<Collection> {
        Arc::new(Collection {
            kind: self.kind,
            namespace: self.namespace.clone(),
            epoch: self.epoch,
            items: self.items.clone(),
            fetch_error: self.fetch_error.clone(),
        })
    }
}
