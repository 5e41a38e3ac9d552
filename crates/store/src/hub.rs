use std::sync::{Mutex, PoisonError, Weak};

use envwatch_api::ServiceSet;
use envwatch_core::KindTag;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::live::{LiveCollection, LiveConfig, LiveInner};

/// Shares one live engine per (kind, namespace) among all interested parties.
///
/// The hub only holds weak references: an engine stays up while at least one
/// [`LiveCollection`] clone is alive and is torn down with the last one.
pub struct LiveHub {
    services: ServiceSet,
    cfg: LiveConfig,
    map: Mutex<FxHashMap<(KindTag, String), Weak<LiveInner>>>,
}

impl LiveHub {
    pub fn new(services: ServiceSet, cfg: LiveConfig) -> Self {
        Self { services, cfg, map: Mutex::new(FxHashMap::default()) }
    }

    pub fn services(&self) -> &ServiceSet { &self.services }

    /// Attach to the engine for `(kind, namespace)`, starting one if none is running.
    /// Returns `None` when no service is registered for `kind`.
    pub fn collection(&self, kind: KindTag, namespace: &str) -> Option<LiveCollection> {
        let Some(service) = self.services.get(kind) else {
            warn!(kind = %kind, "hub: no resource service registered");
            return None;
        };
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, w| w.strong_count() > 0);
        let key = (kind, namespace.to_string());
        if let Some(inner) = map.get(&key).and_then(|w| w.upgrade()) {
            debug!(kind = %kind, ns = %namespace, "hub: attached to running collection");
            return Some(LiveCollection { inner });
        }
        let live = LiveCollection::spawn(service, namespace, self.cfg);
        map.insert(key, live.downgrade());
        Some(live)
    }

    /// Number of engines currently running.
    pub fn active(&self) -> usize {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|w| w.strong_count() > 0).count()
    }
}
