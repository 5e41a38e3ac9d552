//! envwatch collaborator contracts.
//!
//! The live collection engine consumes one [`ResourceService`] per resource kind and
//! a [`SpaceResolver`] that maps a space id to its environments. Implementations
//! live elsewhere (Kubernetes in `envwatch-kubehub`, in-memory mocks here).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use envwatch_core::{FetchError, KindTag, Resource, Space, WatchError};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Raw watch message `{type, object}` or a stream failure.
pub type WireItem = Result<serde_json::Value, WatchError>;

/// Per-kind list + watch contract.
#[async_trait::async_trait]
pub trait ResourceService: Send + Sync {
    fn kind(&self) -> KindTag;

    /// One-shot listing of the namespace, in server order.
    async fn list(&self, namespace: &str) -> Result<Vec<Resource>, FetchError>;

    /// Open an incremental event stream for the namespace.
    async fn watch(&self, namespace: &str) -> Result<StreamHandle<WireItem>, WatchError>;
}

/// Resolves a space id to its environments.
#[async_trait::async_trait]
pub trait SpaceResolver: Send + Sync {
    async fn resolve(&self, space: &str) -> Result<Space, FetchError>;
}

/// Services keyed by the kind they serve.
#[derive(Clone, Default)]
pub struct ServiceSet {
    map: HashMap<KindTag, Arc<dyn ResourceService>>,
}

impl ServiceSet {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, svc: Arc<dyn ResourceService>) {
        self.map.insert(svc.kind(), svc);
    }

    pub fn with(mut self, svc: Arc<dyn ResourceService>) -> Self {
        self.insert(svc);
        self
    }

    pub fn get(&self, kind: KindTag) -> Option<Arc<dyn ResourceService>> {
        self.map.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<KindTag> {
        let mut v: Vec<_> = self.map.keys().copied().collect();
        v.sort();
        v
    }
}

// ----------------- Streaming primitives -----------------

/// Cancellation handle that aborts the underlying task, explicitly or on drop.
pub struct CancelHandle { task: Option<tokio::task::JoinHandle<()>> }

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self { Self { task: Some(task) } }
    pub fn noop() -> Self { Self { task: None } }
    pub fn cancel(mut self) { self.abort(); }

    /// Abort the task and wait until it has actually stopped running.
    pub async fn stop(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
            let _ = h.await;
        }
    }

    fn abort(&mut self) {
        if let Some(h) = self.task.take() { h.abort(); }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) { self.abort(); }
}

/// Generic stream handle used by watch endpoints.
pub struct StreamHandle<T> { pub rx: mpsc::Receiver<T>, pub cancel: CancelHandle }

// ----------------- Mock implementations -----------------

/// In-memory resource service for tests and demos.
///
/// Lists are scripted per namespace; watch messages are pushed by the caller
/// into every stream currently open for that namespace.
pub struct MockService {
    kind: KindTag,
    lists: Mutex<HashMap<String, Result<Vec<serde_json::Value>, FetchError>>>,
    feeds: Mutex<HashMap<String, Vec<mpsc::Sender<WireItem>>>>,
    fail_watch: bool,
    gate_tx: watch::Sender<bool>,
    list_calls: Mutex<usize>,
}

impl MockService {
    pub fn new(kind: KindTag) -> Self {
        let (gate_tx, _) = watch::channel(true);
        Self {
            kind,
            lists: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            fail_watch: false,
            gate_tx,
            list_calls: Mutex::new(0),
        }
    }

    pub fn with_list(self, namespace: &str, items: Vec<serde_json::Value>) -> Self {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner).insert(namespace.to_string(), Ok(items));
        self
    }

    pub fn with_list_error(self, namespace: &str, err: FetchError) -> Self {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner).insert(namespace.to_string(), Err(err));
        self
    }

    /// Every `watch` call fails to open.
    pub fn with_watch_failure(mut self) -> Self {
        self.fail_watch = true;
        self
    }

    /// Hold `list` responses until [`MockService::release_lists`] is called.
    pub fn hold_lists(&self) { self.gate_tx.send_replace(false); }
    pub fn release_lists(&self) { self.gate_tx.send_replace(true); }

    pub fn list_calls(&self) -> usize { *self.list_calls.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Number of watch streams for `namespace` whose consumer is still attached.
    pub fn open_watches(&self, namespace: &str) -> usize {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds.get(namespace).map(|v| v.iter().filter(|tx| !tx.is_closed()).count()).unwrap_or(0)
    }

    /// Wait until at least one consumer has a watch open on `namespace`.
    pub async fn wait_for_watch(&self, namespace: &str) {
        for _ in 0..400 {
            if self.open_watches(namespace) > 0 { return; }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Push a raw wire message to every open stream of `namespace`.
    pub async fn push(&self, namespace: &str, msg: serde_json::Value) {
        self.send(namespace, Ok(msg)).await;
    }

    /// Break every open stream of `namespace` with an error item.
    pub async fn fail(&self, namespace: &str, err: WatchError) {
        self.send(namespace, Err(err)).await;
    }

    async fn send(&self, namespace: &str, item: WireItem) {
        let senders: Vec<_> = {
            let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
            feeds.get(namespace).cloned().unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(item.clone()).await;
        }
    }
}

#[async_trait::async_trait]
impl ResourceService for MockService {
    fn kind(&self) -> KindTag { self.kind }

    async fn list(&self, namespace: &str) -> Result<Vec<Resource>, FetchError> {
        *self.list_calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let mut gate = self.gate_tx.subscribe();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() { break; }
        }
        let scripted = self.lists.lock().unwrap_or_else(PoisonError::into_inner).get(namespace).cloned();
        match scripted {
            Some(Ok(items)) => Ok(items.into_iter().filter_map(|raw| Resource::from_raw(self.kind, raw)).collect()),
            Some(Err(e)) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    async fn watch(&self, namespace: &str) -> Result<StreamHandle<WireItem>, WatchError> {
        if self.fail_watch {
            return Err(WatchError::Open(format!("mock watch refused for {}/{}", self.kind, namespace)));
        }
        let (tx, rx) = mpsc::channel(256);
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = feeds.entry(namespace.to_string()).or_default();
        entry.retain(|t| !t.is_closed());
        entry.push(tx);
        debug!(kind = %self.kind, ns = %namespace, "mock: watch opened");
        Ok(StreamHandle { rx, cancel: CancelHandle::noop() })
    }
}

/// In-memory space resolver; unknown ids resolve to `NotFound`.
#[derive(Default)]
pub struct MockResolver { spaces: HashMap<String, Space> }

impl MockResolver {
    pub fn new() -> Self { Self::default() }

    pub fn with_space(mut self, space: Space) -> Self {
        self.spaces.insert(space.id.clone(), space);
        self
    }
}

#[async_trait::async_trait]
impl SpaceResolver for MockResolver {
    async fn resolve(&self, space: &str) -> Result<Space, FetchError> {
        self.spaces.get(space).cloned().ok_or_else(|| FetchError::NotFound(space.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_service_scripts_lists_and_feeds_watches() {
        let svc = MockService::new(KindTag::Pod)
            .with_list("ns", vec![serde_json::json!({ "metadata": { "name": "a" } })])
            .with_list_error("gone", FetchError::NotFound("gone".into()));
        let items = svc.list("ns").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "a");
        assert_eq!(svc.list("gone").await, Err(FetchError::NotFound("gone".into())));
        assert_eq!(svc.list_calls(), 2);

        let mut h = svc.watch("ns").await.unwrap();
        assert_eq!(svc.open_watches("ns"), 1);
        svc.push("ns", serde_json::json!({ "type": "ADDED" })).await;
        assert!(h.rx.recv().await.unwrap().is_ok());
        drop(h);
        assert_eq!(svc.open_watches("ns"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_waits_for_the_task_to_be_gone() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let handle = CancelHandle::new(tokio::spawn(async move {
            let _keep = tx;
            std::future::pending::<()>().await;
        }));
        handle.stop().await;
        // the task's captures are dropped once stop returns
        assert!(rx.try_recv().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn mock_resolver_rejects_unknown_spaces() {
        let r = MockResolver::new().with_space(Space::new("demo", Vec::new()));
        assert!(r.resolve("demo").await.is_ok());
        assert_eq!(r.resolve("nope").await, Err(FetchError::NotFound("nope".into())));
    }
}
