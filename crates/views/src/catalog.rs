use std::sync::Arc;

use envwatch_core::{Collection, KindTag};

use crate::combine::{deployment_views, plain, replica_views};
use crate::ViewItem;

/// Combinator over the input collections of a [`ViewSpec`], in `inputs` order.
/// Missing trailing inputs are treated as empty.
pub type Combine = fn(&[Arc<Collection>]) -> Vec<ViewItem>;

/// One tracked kind as shown to the presentation layer.
#[derive(Clone, Copy)]
pub struct ViewSpec {
    /// Singular display name, e.g. `Deployment`.
    pub title: &'static str,
    pub path: &'static str,
    pub inputs: &'static [KindTag],
    pub combine: Combine,
}

impl std::fmt::Debug for ViewSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSpec").field("title", &self.title).field("path", &self.path).field("inputs", &self.inputs).finish()
    }
}

impl ViewSpec {
    /// Title shown before the first snapshot, e.g. `Pods`.
    pub fn default_title(&self) -> String {
        format!("{}s", self.title)
    }

    /// `"<count> <Title>"`, pluralized by count.
    pub fn title_for(&self, count: usize) -> String {
        format!("{} {}{}", count, self.title, if count == 1 { "" } else { "s" })
    }
}

fn input(inputs: &[Arc<Collection>], idx: usize, kind: KindTag) -> Arc<Collection> {
    inputs.get(idx).cloned().unwrap_or_else(|| Arc::new(Collection::empty(kind, "")))
}

fn deployments(inputs: &[Arc<Collection>]) -> Vec<ViewItem> {
    deployment_views(
        &input(inputs, 0, KindTag::Deployment),
        &input(inputs, 1, KindTag::DeploymentConfig),
        &input(inputs, 2, KindTag::Service),
    )
}

fn replicas(inputs: &[Arc<Collection>]) -> Vec<ViewItem> {
    replica_views(
        &input(inputs, 0, KindTag::ReplicaSet),
        &input(inputs, 1, KindTag::ReplicationController),
        &input(inputs, 2, KindTag::Service),
    )
}

fn single(inputs: &[Arc<Collection>]) -> Vec<ViewItem> {
    inputs.first().map(|c| plain(c)).unwrap_or_default()
}

/// Kinds tracked per environment, in display order.
pub static TRACKED: [ViewSpec; 6] = [
    ViewSpec {
        title: "Deployment",
        path: "deployments",
        inputs: &[KindTag::Deployment, KindTag::DeploymentConfig, KindTag::Service],
        combine: deployments,
    },
    ViewSpec {
        title: "Replica",
        path: "replicasets",
        inputs: &[KindTag::ReplicaSet, KindTag::ReplicationController, KindTag::Service],
        combine: replicas,
    },
    ViewSpec { title: "Pod", path: "pods", inputs: &[KindTag::Pod], combine: single },
    ViewSpec { title: "Service", path: "services", inputs: &[KindTag::Service], combine: single },
    ViewSpec { title: "ConfigMap", path: "configmaps", inputs: &[KindTag::ConfigMap], combine: single },
    ViewSpec { title: "Event", path: "events", inputs: &[KindTag::Event], combine: single },
];

/// Look a tracked view up by path or title, case-insensitively.
pub fn find_view(name: &str) -> Option<&'static ViewSpec> {
    TRACKED.iter().find(|v| v.path.eq_ignore_ascii_case(name) || v.title.eq_ignore_ascii_case(name))
}
