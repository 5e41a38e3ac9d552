use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use envwatch_api::{CancelHandle, ResourceService, StreamHandle, WireItem};
use envwatch_core::{decode_wire_value, Collection, KindTag, WatchEvent};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::CollectionBuilder;

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveConfig {
    /// Upper bound on queued watch messages folded into one published snapshot.
    pub batch_cap: usize,
}

impl Default for LiveConfig {
    fn default() -> Self { Self { batch_cap: 2048 } }
}

impl LiveConfig {
    /// Reads `ENVWATCH_QUEUE_CAP`.
    pub fn from_env() -> Self {
        let batch_cap = std::env::var("ENVWATCH_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
        Self { batch_cap: batch_cap.max(1) }
    }
}

pub(crate) struct LiveInner {
    kind: KindTag,
    namespace: String,
    snap: Arc<ArcSwapOption<Collection>>,
    epoch_rx: watch::Receiver<u64>,
    _task: CancelHandle,
}

impl Drop for LiveInner {
    fn drop(&mut self) {
        metrics::decrement_gauge!("envwatch_live_collections", 1.0);
        info!(kind = %self.kind, ns = %self.namespace, "live: collection released");
    }
}

/// Handle to a continuously updated collection for one (kind, namespace) pair.
///
/// Clones share the engine. The engine task, its watch connection and any
/// buffered events are released when the last clone is dropped.
#[derive(Clone)]
pub struct LiveCollection {
    pub(crate) inner: Arc<LiveInner>,
}

impl LiveCollection {
    /// Start list + watch for `namespace` on a fresh engine task.
    pub fn spawn(service: Arc<dyn ResourceService>, namespace: &str, cfg: LiveConfig) -> Self {
        let kind = service.kind();
        let snap = Arc::new(ArcSwapOption::<Collection>::empty());
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let task = tokio::spawn(run(service, namespace.to_string(), cfg, Arc::clone(&snap), epoch_tx));
        metrics::increment_gauge!("envwatch_live_collections", 1.0);
        info!(kind = %kind, ns = %namespace, "live: collection started");
        Self {
            inner: Arc::new(LiveInner {
                kind,
                namespace: namespace.to_string(),
                snap,
                epoch_rx,
                _task: CancelHandle::new(task),
            }),
        }
    }

    pub fn kind(&self) -> KindTag { self.inner.kind }
    pub fn namespace(&self) -> &str { &self.inner.namespace }

    /// Latest snapshot; `None` until the baseline list has resolved.
    pub fn current(&self) -> Option<Arc<Collection>> { self.inner.snap.load_full() }

    /// Epoch notifications; fires on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.inner.epoch_rx.clone() }

    /// Wait for the first snapshot at or past `epoch`.
    pub async fn wait_epoch(&self, epoch: u64) -> Option<Arc<Collection>> {
        let mut rx = self.subscribe();
        while *rx.borrow_and_update() < epoch {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.current()
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<LiveInner> { Arc::downgrade(&self.inner) }
}

async fn next_item(stream: &mut Option<StreamHandle<WireItem>>) -> Option<WireItem> {
    match stream.as_mut() {
        Some(h) => h.rx.recv().await,
        None => std::future::pending().await,
    }
}

fn decode_into(kind: KindTag, ns: &str, msg: serde_json::Value, out: &mut Vec<WatchEvent>) {
    match decode_wire_value(kind, msg) {
        Ok(WatchEvent::Error(message)) => {
            warn!(kind = %kind, ns = %ns, error = %message, "live: server reported watch error; ignoring");
            counter!("envwatch_watch_events_ignored_total", 1u64, "kind" => kind.as_str());
        }
        Ok(ev) => {
            counter!("envwatch_watch_events_total", 1u64, "kind" => kind.as_str(), "type" => ev.type_str());
            out.push(ev);
        }
        Err(e) => {
            debug!(kind = %kind, ns = %ns, error = %e, "live: ignoring malformed watch event");
            counter!("envwatch_watch_events_ignored_total", 1u64, "kind" => kind.as_str());
        }
    }
}

fn publish(builder: &CollectionBuilder, snap: &ArcSwapOption<Collection>, epoch_tx: &watch::Sender<u64>) {
    let next = builder.freeze();
    let epoch = next.epoch;
    snap.store(Some(next));
    epoch_tx.send_replace(epoch);
}

async fn run(
    service: Arc<dyn ResourceService>,
    namespace: String,
    cfg: LiveConfig,
    snap: Arc<ArcSwapOption<Collection>>,
    epoch_tx: watch::Sender<u64>,
) {
    let kind = service.kind();
    let t0 = Instant::now();
    let mut builder = CollectionBuilder::new(kind, namespace.as_str());
    // Events that arrive before the baseline lands
    let mut pending: Vec<WatchEvent> = Vec::new();
    let mut listed = false;
    let mut opening = true;
    let mut stream: Option<StreamHandle<WireItem>> = None;

    let list_fut = service.list(&namespace);
    let open_fut = service.watch(&namespace);
    tokio::pin!(list_fut);
    tokio::pin!(open_fut);

    loop {
        tokio::select! {
            res = &mut list_fut, if !listed => {
                listed = true;
                let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
                histogram!("envwatch_list_ms", took_ms, "kind" => kind.as_str());
                match res {
                    Ok(items) => {
                        info!(kind = %kind, ns = %namespace, items = items.len(), took_ms = took_ms as u64, "live: baseline listed");
                        builder.baseline(items);
                    }
                    Err(e) => {
                        warn!(kind = %kind, ns = %namespace, error = %e, "live: list failed; starting empty");
                        counter!("envwatch_list_failures_total", 1u64, "kind" => kind.as_str());
                        builder.baseline_failed(e);
                    }
                }
                if !pending.is_empty() {
                    debug!(kind = %kind, ns = %namespace, buffered = pending.len(), "live: applying buffered events");
                    builder.apply(std::mem::take(&mut pending));
                }
                publish(&builder, &snap, &epoch_tx);
            }
            res = &mut open_fut, if opening => {
                opening = false;
                match res {
                    Ok(h) => {
                        debug!(kind = %kind, ns = %namespace, "live: watch opened");
                        stream = Some(h);
                    }
                    Err(e) => {
                        warn!(kind = %kind, ns = %namespace, error = %e, "live: watch failed to open; serving last listing");
                        counter!("envwatch_watch_failures_total", 1u64, "kind" => kind.as_str());
                    }
                }
            }
            item = next_item(&mut stream) => {
                let mut items = vec![item];
                if let Some(h) = stream.as_mut() {
                    while items.len() < cfg.batch_cap {
                        match h.rx.try_recv() {
                            Ok(more) => items.push(Some(more)),
                            Err(_) => break,
                        }
                    }
                }
                let mut events = Vec::with_capacity(items.len());
                let mut broken = None;
                for item in items {
                    match item {
                        Some(Ok(msg)) => decode_into(kind, &namespace, msg, &mut events),
                        Some(Err(e)) => { broken = Some(e.to_string()); break; }
                        None => { broken = Some("closed".to_string()); break; }
                    }
                }
                if listed {
                    if builder.apply(events) > 0 {
                        publish(&builder, &snap, &epoch_tx);
                    }
                } else {
                    pending.extend(events);
                }
                if let Some(reason) = broken {
                    warn!(kind = %kind, ns = %namespace, reason = %reason, "live: watch stream ended; serving last known state");
                    counter!("envwatch_watch_failures_total", 1u64, "kind" => kind.as_str());
                    stream = None;
                }
            }
        }
        if listed && !opening && stream.is_none() {
            break;
        }
    }
    info!(kind = %kind, ns = %namespace, epoch = builder.epoch(), ran_ms = %t0.elapsed().as_millis(), "live: engine idle; list-only from here");
}
