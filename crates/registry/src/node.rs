use std::sync::Arc;
use std::time::Duration;

use envwatch_core::{Collection, Environment};
use envwatch_store::LiveCollection;
use envwatch_views::{filter_by_space, ViewItem, ViewSpec};
use futures::future::select_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of one collection within a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unstarted,
    Loading,
    Ready,
}

/// What the presentation layer sees for one tracked kind.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionState {
    pub title: String,
    pub phase: Phase,
    pub items: Arc<Vec<ViewItem>>,
}

impl CollectionState {
    pub fn unstarted(view: &ViewSpec) -> Self {
        Self { title: view.default_title(), phase: Phase::Unstarted, items: Arc::new(Vec::new()) }
    }

    pub fn loading(&self) -> bool { self.phase != Phase::Ready }
}

/// One tracked kind inside one environment.
#[derive(Clone)]
pub struct KindNode {
    pub view: &'static ViewSpec,
    pub environment: Environment,
    pub state: watch::Receiver<CollectionState>,
}

impl KindNode {
    pub fn current(&self) -> CollectionState { self.state.borrow().clone() }
}

/// Inputs of one node: `None` where no service serves that kind.
pub(crate) struct NodeInputs {
    pub view: &'static ViewSpec,
    pub namespace: String,
    pub inputs: Vec<Option<LiveCollection>>,
    pub label: Option<String>,
    pub empty_grace: Duration,
}

impl NodeInputs {
    /// Latest snapshot of every input, or `None` while any baseline is still in flight.
    fn snapshot(&self) -> Option<Vec<Arc<Collection>>> {
        self.inputs
            .iter()
            .zip(self.view.inputs.iter())
            .map(|(live, kind)| match live {
                Some(l) => l.current(),
                None => Some(Arc::new(Collection::empty(*kind, self.namespace.as_str()))),
            })
            .collect()
    }

    fn derive(&self) -> Option<Vec<ViewItem>> {
        let snaps = self.snapshot()?;
        Some(filter_by_space((self.view.combine)(&snaps), self.label.as_deref()))
    }
}

/// Resolves on the next change of any open input. Returns `false` once every input has closed.
async fn next_change(rxs: &mut [watch::Receiver<u64>], open: &mut [bool]) -> bool {
    let futs: Vec<_> = rxs
        .iter_mut()
        .enumerate()
        .filter(|(i, _)| open[*i])
        .map(|(i, rx)| Box::pin(async move { (i, rx.changed().await.is_ok()) }))
        .collect();
    if futs.is_empty() {
        return false;
    }
    let ((idx, ok), _, _) = select_all(futs).await;
    if !ok {
        open[idx] = false;
    }
    true
}

fn ready(view: &ViewSpec, items: Vec<ViewItem>) -> CollectionState {
    CollectionState { title: view.title_for(items.len()), phase: Phase::Ready, items: Arc::new(items) }
}

/// Recombine on every input change and publish. An empty first result waits out the grace window.
pub(crate) async fn drive(node: NodeInputs, tx: Arc<watch::Sender<CollectionState>>) {
    let view = node.view;
    let mut rxs: Vec<watch::Receiver<u64>> = node.inputs.iter().flatten().map(|l| l.subscribe()).collect();
    let mut open = vec![true; rxs.len()];
    let mut any_open = !rxs.is_empty();
    let grace = tokio::time::sleep(node.empty_grace);
    tokio::pin!(grace);
    let mut armed = false;

    loop {
        if let Some(items) = node.derive() {
            // Only the first publication is debounced; once Ready, emptiness is real.
            let published = tx.borrow().phase == Phase::Ready;
            if !items.is_empty() || published {
                armed = false;
                tx.send_replace(ready(view, items));
            } else if !armed {
                debug!(view = view.path, ns = %node.namespace, "registry: empty result; waiting out grace window");
                grace.as_mut().reset(Instant::now() + node.empty_grace);
                armed = true;
            }
        }
        if !armed && !any_open {
            break;
        }
        tokio::select! {
            _ = &mut grace, if armed => {
                armed = false;
                tx.send_replace(ready(view, Vec::new()));
            }
            alive = next_change(&mut rxs, &mut open), if any_open => {
                any_open = alive;
            }
        }
    }
    debug!(view = view.path, ns = %node.namespace, "registry: node inputs closed");
}
