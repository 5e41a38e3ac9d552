use std::sync::Arc;

use envwatch_core::{Collection, Resource};
use rustc_hash::FxHashMap;

use crate::{ControllerView, ViewItem};

/// Merge two controller sources by name.
///
/// `config` entries are folded after `base`: a same-named config entry replaces
/// the base entry in its slot, new names are appended in `config` order.
pub fn combine_controllers(base: &[Arc<Resource>], config: &[Arc<Resource>]) -> Vec<Arc<Resource>> {
    let mut out: Vec<Arc<Resource>> = Vec::with_capacity(base.len() + config.len());
    let mut slot: FxHashMap<&str, usize> = FxHashMap::default();
    for r in base.iter().chain(config.iter()) {
        match slot.get(r.name.as_str()) {
            Some(&idx) => out[idx] = Arc::clone(r),
            None => {
                slot.insert(r.name.as_str(), out.len());
                out.push(Arc::clone(r));
            }
        }
    }
    out
}

/// Services whose non-empty selector is a subset of the controller's pod template labels.
pub fn exposing_services(controller: &Resource, services: &[Arc<Resource>]) -> Vec<Arc<Resource>> {
    let pod_labels = controller.pod_template_labels();
    if pod_labels.is_empty() {
        return Vec::new();
    }
    services
        .iter()
        .filter(|svc| {
            let selector = svc.service_selector();
            !selector.is_empty() && selector.iter().all(|pair| pod_labels.contains(pair))
        })
        .cloned()
        .collect()
}

fn controller_views(controllers: Vec<Arc<Resource>>, services: &[Arc<Resource>]) -> Vec<ViewItem> {
    controllers
        .into_iter()
        .map(|c| {
            let services = exposing_services(&c, services);
            ViewItem::Controller(ControllerView { name: c.name.clone(), controller: c, services })
        })
        .collect()
}

/// Deployments joined with DeploymentConfigs (configs shadow same-named deployments),
/// each annotated with its exposing services.
pub fn deployment_views(deployments: &Collection, configs: &Collection, services: &Collection) -> Vec<ViewItem> {
    controller_views(combine_controllers(&deployments.items, &configs.items), &services.items)
}

/// ReplicaSets joined with ReplicationControllers, annotated with services.
pub fn replica_views(replica_sets: &Collection, controllers: &Collection, services: &Collection) -> Vec<ViewItem> {
    controller_views(combine_controllers(&replica_sets.items, &controllers.items), &services.items)
}

/// A collection passed through unchanged.
pub fn plain(c: &Collection) -> Vec<ViewItem> {
    c.items.iter().cloned().map(ViewItem::Resource).collect()
}
