//! envwatch registry: the page coordinator.
//!
//! For a selected space and optional label filter the registry resolves the
//! space's environments and, per environment, wires every tracked view to its
//! live collections. Consumers read:
//! - [`Registry::environments`]: one [`EnvironmentEntry`] per environment, each with a
//!   [`KindNode`] per tracked view carrying `{title, loading, items}`;
//! - [`Registry::loading`]: `true` until the environment list is first published;
//! - [`Registry::notifications`]: user-facing warnings (inaccessible namespace).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use envwatch_api::{CancelHandle, SpaceResolver};
use envwatch_core::Environment;
use envwatch_store::LiveHub;
use envwatch_views::{ViewSpec, TRACKED};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

mod node;

pub use node::{CollectionState, KindNode, Phase};
use node::{drive, NodeInputs};

/// Registry configuration, threaded in at construction.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL of the cluster web console, if any.
    pub console_url: Option<String>,
    /// How long an empty per-kind result is held back before it is published.
    pub empty_grace: Duration,
    /// How long an empty environment list is held back before it is published.
    pub environments_grace: Duration,
    pub views: Vec<&'static ViewSpec>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            console_url: None,
            empty_grace: Duration::from_millis(200),
            environments_grace: Duration::from_millis(200),
            views: TRACKED.iter().collect(),
        }
    }
}

impl RegistryConfig {
    /// Reads `ENVWATCH_CONSOLE_URL`, `ENVWATCH_EMPTY_GRACE_MS` and `ENVWATCH_ENVIRONMENTS_GRACE_MS`.
    pub fn from_env() -> Self {
        let ms = |key: &str, default: u64| {
            std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(Duration::from_millis(default))
        };
        Self {
            console_url: std::env::var("ENVWATCH_CONSOLE_URL").ok().filter(|s| !s.is_empty()),
            empty_grace: ms("ENVWATCH_EMPTY_GRACE_MS", 200),
            environments_grace: ms("ENVWATCH_ENVIRONMENTS_GRACE_MS", 200),
            views: TRACKED.iter().collect(),
        }
    }
}

/// What to watch: a space and an optional `space` label filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Context {
    pub space: String,
    pub label: Option<String>,
}

impl Context {
    pub fn new(space: impl Into<String>, label: Option<String>) -> Self {
        Self { space: space.into(), label: label.filter(|l| !l.is_empty()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Warning,
}

/// User-visible message raised by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

/// One environment of the selected space.
#[derive(Clone)]
pub struct EnvironmentEntry {
    pub environment: Environment,
    pub console_url: Option<String>,
    pub kinds: Vec<KindNode>,
}

/// `<base>/project/<namespace>/overview`, or the base itself when the environment has no namespace.
pub fn console_url(base: Option<&str>, env: &Environment) -> Option<String> {
    let base = base?;
    if env.namespace.is_empty() {
        return Some(base.to_string());
    }
    Some(path_join(&[base, "/project", &env.namespace, "/overview"]))
}

fn path_join(parts: &[&str]) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        let trimmed = if i == 0 { part.trim_end_matches('/') } else { part.trim_matches('/') };
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(trimmed);
    }
    out
}

fn inaccessible_message(space: &str) -> String {
    format!(
        "Something went wrong your environments as the Kubernetes Namespace '{}' is not accessible to you or does not exist.",
        space
    )
}

struct Selection {
    context: Context,
    states: Vec<(&'static ViewSpec, Arc<watch::Sender<CollectionState>>)>,
    tasks: Vec<CancelHandle>,
}

pub struct Registry {
    hub: Arc<LiveHub>,
    resolver: Arc<dyn SpaceResolver>,
    cfg: RegistryConfig,
    notify_tx: broadcast::Sender<Notification>,
    envs_tx: Arc<watch::Sender<Arc<Vec<EnvironmentEntry>>>>,
    loading_tx: Arc<watch::Sender<bool>>,
    current: Option<Selection>,
}

impl Registry {
    pub fn new(hub: Arc<LiveHub>, resolver: Arc<dyn SpaceResolver>, cfg: RegistryConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(16);
        let (envs_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (loading_tx, _) = watch::channel(true);
        Self { hub, resolver, cfg, notify_tx, envs_tx: Arc::new(envs_tx), loading_tx: Arc::new(loading_tx), current: None }
    }

    pub fn config(&self) -> &RegistryConfig { &self.cfg }
    pub fn context(&self) -> Option<&Context> { self.current.as_ref().map(|s| &s.context) }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> { self.notify_tx.subscribe() }
    pub fn environments(&self) -> watch::Receiver<Arc<Vec<EnvironmentEntry>>> { self.envs_tx.subscribe() }
    pub fn loading(&self) -> watch::Receiver<bool> { self.loading_tx.subscribe() }

    /// Tear down the current selection and release its subscriptions.
    ///
    /// Every node task has stopped by the time this returns, so the `Unstarted`
    /// reset is the last state the old nodes publish and their engines are
    /// already released.
    pub async fn clear(&mut self) {
        let Some(Selection { context, states, tasks }) = self.current.take() else { return };
        info!(space = %context.space, "registry: stopping previous selection");
        for task in tasks {
            task.stop().await;
        }
        for (view, tx) in states.iter() {
            tx.send_replace(CollectionState::unstarted(view));
        }
        self.envs_tx.send_replace(Arc::new(Vec::new()));
        self.loading_tx.send_replace(true);
    }

    /// Switch to `ctx`: release the previous selection, resolve the space and start
    /// one live view per (environment, tracked kind).
    pub async fn select(&mut self, ctx: Context) {
        self.clear().await;
        info!(space = %ctx.space, label = ?ctx.label, "registry: selecting");
        let environments = match self.resolver.resolve(&ctx.space).await {
            Ok(space) => space.environments,
            Err(e) => {
                warn!(space = %ctx.space, error = %e, "registry: space not accessible; continuing empty");
                metrics::counter!("envwatch_space_failures_total", 1u64);
                let _ = self.notify_tx.send(Notification {
                    level: NotificationLevel::Warning,
                    message: inaccessible_message(&ctx.space),
                });
                Vec::new()
            }
        };

        let mut tasks = Vec::new();
        let mut states = Vec::new();
        let mut entries = Vec::with_capacity(environments.len());
        for environment in environments {
            let mut kinds = Vec::with_capacity(self.cfg.views.len());
            for &view in self.cfg.views.iter() {
                let inputs = view.inputs.iter().map(|k| self.hub.collection(*k, &environment.namespace)).collect();
                let mut initial = CollectionState::unstarted(view);
                initial.phase = Phase::Loading;
                let (tx, rx) = watch::channel(initial);
                let tx = Arc::new(tx);
                let node = NodeInputs {
                    view,
                    namespace: environment.namespace.clone(),
                    inputs,
                    label: ctx.label.clone(),
                    empty_grace: self.cfg.empty_grace,
                };
                tasks.push(CancelHandle::new(tokio::spawn(drive(node, Arc::clone(&tx)))));
                states.push((view, tx));
                kinds.push(KindNode { view, environment: environment.clone(), state: rx });
            }
            entries.push(EnvironmentEntry {
                console_url: console_url(self.cfg.console_url.as_deref(), &environment),
                environment,
                kinds,
            });
        }
        info!(space = %ctx.space, environments = entries.len(), collections = self.hub.active(), "registry: selection wired");

        let entries = Arc::new(entries);
        if entries.is_empty() {
            // Hold an empty environment list back for the grace window
            let envs_tx = Arc::clone(&self.envs_tx);
            let loading_tx = Arc::clone(&self.loading_tx);
            let grace = self.cfg.environments_grace;
            tasks.push(CancelHandle::new(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                envs_tx.send_replace(entries);
                loading_tx.send_replace(false);
            })));
        } else {
            self.envs_tx.send_replace(entries);
            self.loading_tx.send_replace(false);
        }
        self.current = Some(Selection { context: ctx, states, tasks });
    }
}
