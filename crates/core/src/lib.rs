//! envwatch core types: resources, collections and watch events.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod space;
pub mod wire;

pub use space::{Environment, Space};
pub use wire::{decode_wire, decode_wire_value, WireError};

/// Resource kinds the engine can list and watch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KindTag {
    Deployment,
    DeploymentConfig,
    ReplicaSet,
    ReplicationController,
    Pod,
    Service,
    ConfigMap,
    Event,
}

impl KindTag {
    pub const ALL: [KindTag; 8] = [
        KindTag::Deployment,
        KindTag::DeploymentConfig,
        KindTag::ReplicaSet,
        KindTag::ReplicationController,
        KindTag::Pod,
        KindTag::Service,
        KindTag::ConfigMap,
        KindTag::Event,
    ];

    /// `group/version/Kind` (or `version/Kind` for the core group).
    pub fn gvk_key(self) -> &'static str {
        match self {
            KindTag::Deployment => "apps/v1/Deployment",
            KindTag::DeploymentConfig => "apps.openshift.io/v1/DeploymentConfig",
            KindTag::ReplicaSet => "apps/v1/ReplicaSet",
            KindTag::ReplicationController => "v1/ReplicationController",
            KindTag::Pod => "v1/Pod",
            KindTag::Service => "v1/Service",
            KindTag::ConfigMap => "v1/ConfigMap",
            KindTag::Event => "v1/Event",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KindTag::Deployment => "Deployment",
            KindTag::DeploymentConfig => "DeploymentConfig",
            KindTag::ReplicaSet => "ReplicaSet",
            KindTag::ReplicationController => "ReplicationController",
            KindTag::Pod => "Pod",
            KindTag::Service => "Service",
            KindTag::ConfigMap => "ConfigMap",
            KindTag::Event => "Event",
        }
    }

    /// Lowercase plural used in API paths.
    pub fn plural(self) -> &'static str {
        match self {
            KindTag::Deployment => "deployments",
            KindTag::DeploymentConfig => "deploymentconfigs",
            KindTag::ReplicaSet => "replicasets",
            KindTag::ReplicationController => "replicationcontrollers",
            KindTag::Pod => "pods",
            KindTag::Service => "services",
            KindTag::ConfigMap => "configmaps",
            KindTag::Event => "events",
        }
    }
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for KindTag {
    type Err = UnknownKind;

    /// Accepts the kind name or its plural path, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        KindTag::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().to_ascii_lowercase() == wanted || k.plural() == wanted)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Label key/value pairs in payload order.
pub type Labels = SmallVec<[(String, String); 8]>;

/// Identity of a resource: `(kind, namespace, name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: KindTag,
    pub namespace: String,
    pub name: String,
}

/// Immutable snapshot of one cluster object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub kind: KindTag,
    pub namespace: String,
    pub name: String,
    pub creation_ts: i64,
    pub labels: Labels,
    /// Raw object (managed fields stripped under the default feature)
    pub raw: serde_json::Value,
}

impl Resource {
    /// Shape a raw object. Returns `None` when `metadata.name` is missing or empty.
    pub fn from_raw(kind: KindTag, mut raw: serde_json::Value) -> Option<Self> {
        strip_managed_fields(&mut raw);
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if name.is_empty() {
            return None;
        }
        let name = name.to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let labels = string_pairs(meta.get("labels"));
        Some(Self { kind, namespace, name, creation_ts, labels, raw })
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey { kind: self.kind, namespace: self.namespace.clone(), name: self.name.clone() }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Labels stamped on the pods a controller creates.
    ///
    /// Falls back to `spec.selector.matchLabels`, then to a flat `spec.selector`
    /// (DeploymentConfig and ReplicationController use the flat form).
    pub fn pod_template_labels(&self) -> Labels {
        let spec = self.raw.get("spec");
        let template = spec
            .and_then(|s| s.get("template"))
            .and_then(|t| t.get("metadata"))
            .and_then(|m| m.get("labels"));
        let labels = string_pairs(template);
        if !labels.is_empty() {
            return labels;
        }
        let selector = spec.and_then(|s| s.get("selector"));
        let match_labels = string_pairs(selector.and_then(|s| s.get("matchLabels")));
        if !match_labels.is_empty() {
            return match_labels;
        }
        string_pairs(selector)
    }

    /// `spec.selector` of a Service.
    pub fn service_selector(&self) -> Labels {
        string_pairs(self.raw.get("spec").and_then(|s| s.get("selector")))
    }
}

fn string_pairs(v: Option<&serde_json::Value>) -> Labels {
    let mut out = Labels::new();
    if let Some(obj) = v.and_then(|m| m.as_object()) {
        for (k, v) in obj.iter() {
            if let Some(val) = v.as_str() {
                out.push((k.clone(), val.to_string()));
            }
        }
    }
    out
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

#[cfg(not(feature = "strip-managed-fields"))]
fn strip_managed_fields(_v: &mut serde_json::Value) {}

/// Ordered, name-unique set of resources of one kind within one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub kind: KindTag,
    pub namespace: String,
    /// Bumped on every published change; 1 is the baseline list.
    pub epoch: u64,
    pub items: Vec<Arc<Resource>>,
    /// Set when the baseline list failed and the collection started empty.
    pub fetch_error: Option<FetchError>,
}

impl Collection {
    pub fn empty(kind: KindTag, namespace: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), epoch: 0, items: Vec::new(), fetch_error: None }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, name: &str) -> Option<&Arc<Resource>> {
        self.items.iter().find(|r| r.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|r| r.name.as_str()).collect()
    }
}

/// One decoded line of an update stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    /// Stream-level error reported by the server, or a substituted no-op.
    Error(String),
}

impl WatchEvent {
    pub fn type_str(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Error(_) => "ERROR",
        }
    }

    pub fn resource(&self) -> Option<&Resource> {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => Some(r),
            WatchEvent::Error(_) => None,
        }
    }
}

/// Failure of the one-shot list call.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Failure to open or keep a watch stream.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("watch open: {0}")]
    Open(String),
    #[error("watch stream: {0}")]
    Stream(String),
    #[error("watch stream closed")]
    Closed,
}

pub mod prelude {
    pub use super::{
        Collection, Environment, FetchError, KindTag, Labels, Resource, ResourceKey, Space, WatchError,
        WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kind_names_and_paths() {
        assert_eq!("pods".parse::<KindTag>().unwrap(), KindTag::Pod);
        assert_eq!("DeploymentConfig".parse::<KindTag>().unwrap(), KindTag::DeploymentConfig);
        assert_eq!("replicationcontrollers".parse::<KindTag>().unwrap(), KindTag::ReplicationController);
        assert!("widgets".parse::<KindTag>().is_err());
    }

    #[test]
    fn shapes_resource_from_raw() {
        let raw = serde_json::json!({
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "creationTimestamp": "2020-01-01T00:00:10Z",
                "labels": { "app": "web", "space": "demo" },
                "managedFields": [{ "manager": "kubectl" }]
            },
            "spec": { "template": { "metadata": { "labels": { "app": "web" } } } }
        });
        let r = Resource::from_raw(KindTag::Deployment, raw).unwrap();
        assert_eq!(r.name, "web");
        assert_eq!(r.namespace, "prod");
        assert_eq!(r.creation_ts, 1_577_836_810);
        assert_eq!(r.label("space"), Some("demo"));
        assert!(r.raw["metadata"].get("managedFields").is_none());
        assert_eq!(r.pod_template_labels().as_slice(), &[("app".to_string(), "web".to_string())]);
    }

    #[test]
    fn unnamed_objects_are_rejected() {
        assert!(Resource::from_raw(KindTag::Pod, serde_json::json!({ "metadata": {} })).is_none());
        assert!(Resource::from_raw(KindTag::Pod, serde_json::json!({ "spec": {} })).is_none());
    }
}
