//! envwatch kubehub: Kubernetes-backed resource services and space resolution.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use envwatch_api::{CancelHandle, ResourceService, ServiceSet, SpaceResolver, StreamHandle, WireItem};
use envwatch_core::{Environment, FetchError, KindTag, Resource, Space, WatchError};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// ConfigMap in the space namespace listing its environments.
pub const ENVIRONMENTS_CONFIGMAP: &str = "fabric8-environments";

const WATCH_BUFFER: usize = 256;

/// Build a client from the ambient kubeconfig or in-cluster config.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// One [`KubeService`] per tracked kind.
pub fn services(client: Client) -> ServiceSet {
    let mut set = ServiceSet::new();
    for kind in KindTag::ALL {
        set.insert(Arc::new(KubeService::new(client.clone(), kind)));
    }
    set
}

fn api_resource(kind: KindTag) -> ApiResource {
    let parts: Vec<&str> = kind.gvk_key().split('/').collect();
    let gvk = match parts.as_slice() {
        [version, k] => GroupVersionKind::gvk("", version, k),
        [group, version, k] => GroupVersionKind::gvk(group, version, k),
        _ => GroupVersionKind::gvk("", "v1", kind.as_str()),
    };
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn fetch_error(e: kube::Error) -> FetchError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => FetchError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 403 => FetchError::Forbidden(resp.message),
        kube::Error::SerdeError(e) => FetchError::Decode(e.to_string()),
        other => FetchError::Transport(other.to_string()),
    }
}

fn wire(ty: &str, obj: DynamicObject) -> Option<serde_json::Value> {
    match serde_json::to_value(obj) {
        Ok(object) => Some(serde_json::json!({ "type": ty, "object": object })),
        Err(e) => {
            warn!(error = %e, "kube: dropping unserializable object");
            None
        }
    }
}

/// Errors after which the watcher re-lists on its own (410 Gone / expired resource version).
fn relists(e: &watcher::Error) -> bool {
    matches!(e, watcher::Error::WatchError(resp) if resp.code == 410)
}

/// Normalises watcher events to the `{type, object}` wire shape.
///
/// The watcher resumes expired watches and re-lists after a desync. A re-list
/// arrives as `Restarted`: names seen before but missing from it are emitted as
/// deletions, everything else as additions or modifications.
#[derive(Default)]
struct WireFeed {
    known: FxHashSet<String>,
}

impl WireFeed {
    fn upsert(&mut self, obj: DynamicObject, out: &mut Vec<serde_json::Value>) {
        let ty = if self.known.insert(obj.name_any()) { "ADDED" } else { "MODIFIED" };
        out.extend(wire(ty, obj));
    }

    fn messages(&mut self, ev: Event<DynamicObject>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        match ev {
            Event::Applied(obj) => self.upsert(obj, &mut out),
            Event::Deleted(obj) => {
                self.known.remove(&obj.name_any());
                out.extend(wire("DELETED", obj));
            }
            Event::Restarted(list) => {
                let fresh: FxHashSet<String> = list.iter().map(|o| o.name_any()).collect();
                let mut gone: Vec<String> = self.known.iter().filter(|n| !fresh.contains(*n)).cloned().collect();
                gone.sort();
                for name in gone {
                    self.known.remove(&name);
                    out.push(serde_json::json!({ "type": "DELETED", "object": { "metadata": { "name": name } } }));
                }
                for obj in list {
                    self.upsert(obj, &mut out);
                }
            }
        }
        out
    }
}

/// List + watch for one kind through the dynamic API.
pub struct KubeService {
    client: Client,
    kind: KindTag,
    ar: ApiResource,
}

impl KubeService {
    pub fn new(client: Client, kind: KindTag) -> Self {
        Self { client, kind, ar: api_resource(kind) }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.ar)
    }
}

#[async_trait::async_trait]
impl ResourceService for KubeService {
    fn kind(&self) -> KindTag { self.kind }

    async fn list(&self, namespace: &str) -> Result<Vec<Resource>, FetchError> {
        metrics::counter!("envwatch_kube_requests_total", 1u64, "verb" => "list", "kind" => self.kind.as_str());
        let list = self.api(namespace).list(&ListParams::default()).await.map_err(fetch_error)?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items {
            let raw = serde_json::to_value(obj).map_err(|e| FetchError::Decode(e.to_string()))?;
            if let Some(r) = Resource::from_raw(self.kind, raw) {
                out.push(r);
            }
        }
        debug!(kind = %self.kind, ns = %namespace, count = out.len(), "kube: listed");
        Ok(out)
    }

    async fn watch(&self, namespace: &str) -> Result<StreamHandle<WireItem>, WatchError> {
        metrics::counter!("envwatch_kube_requests_total", 1u64, "verb" => "watch", "kind" => self.kind.as_str());
        let stream = watcher::watcher(self.api(namespace), watcher::Config::default());
        let (tx, rx) = mpsc::channel::<WireItem>(WATCH_BUFFER);
        let (open_tx, open_rx) = oneshot::channel::<Result<(), WatchError>>();
        let kind = self.kind;
        let ns = namespace.to_string();
        let task = tokio::spawn(async move {
            futures::pin_mut!(stream);
            let mut open_tx = Some(open_tx);
            let mut feed = WireFeed::default();
            while let Some(item) = stream.next().await {
                let ev = match item {
                    Ok(ev) => ev,
                    Err(e) if relists(&e) => {
                        debug!(kind = %kind, ns = %ns, error = %e, "kube: watch desynced; watcher re-lists");
                        metrics::counter!("envwatch_kube_relists_total", 1u64, "kind" => kind.as_str());
                        continue;
                    }
                    Err(e) => {
                        match open_tx.take() {
                            Some(open) => {
                                let _ = open.send(Err(WatchError::Open(e.to_string())));
                            }
                            None => {
                                let _ = tx.send(Err(WatchError::Stream(e.to_string()))).await;
                            }
                        }
                        break;
                    }
                };
                if let Some(open) = open_tx.take() {
                    info!(kind = %kind, ns = %ns, "kube: watch opened");
                    let _ = open.send(Ok(()));
                }
                for msg in feed.messages(ev) {
                    if tx.send(Ok(msg)).await.is_err() {
                        return;
                    }
                }
            }
            debug!(kind = %kind, ns = %ns, "kube: watch stream ended");
        });
        let cancel = CancelHandle::new(task);
        match open_rx.await {
            Ok(Ok(())) => Ok(StreamHandle { rx, cancel }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WatchError::Open(format!("watch task for {}/{} ended early", self.kind, namespace))),
        }
    }
}

/// Parse the `fabric8-environments` data: every value is a YAML environment.
fn environments_from_data(data: &BTreeMap<String, String>) -> Vec<Environment> {
    let mut out = Vec::with_capacity(data.len());
    for (key, value) in data {
        match serde_yaml::from_str::<Environment>(value) {
            Ok(env) => out.push(env),
            Err(e) => warn!(key = %key, error = %e, "kube: skipping unparsable environment entry"),
        }
    }
    out
}

/// Resolves a space id (a namespace) to its environments.
pub struct KubeSpaceResolver {
    client: Client,
}

impl KubeSpaceResolver {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl SpaceResolver for KubeSpaceResolver {
    async fn resolve(&self, space: &str) -> Result<Space, FetchError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces.get(space).await.map_err(fetch_error)?;

        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), space);
        let cm = configmaps.get_opt(ENVIRONMENTS_CONFIGMAP).await.map_err(fetch_error)?;
        let environments = match cm.and_then(|cm| cm.data) {
            Some(data) => environments_from_data(&data),
            None => Vec::new(),
        };
        let environments = if environments.is_empty() {
            debug!(space = %space, "kube: no environments configmap; using the namespace itself");
            vec![Environment { name: space.to_string(), namespace: space.to_string(), order: 0 }]
        } else {
            environments
        };
        info!(space = %space, environments = environments.len(), "kube: space resolved");
        Ok(Space::new(space, environments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    #[test]
    fn api_resources_use_exact_plurals() {
        let ar = api_resource(KindTag::DeploymentConfig);
        assert_eq!(ar.group, "apps.openshift.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "deploymentconfigs");
        let ar = api_resource(KindTag::Pod);
        assert_eq!(ar.group, "");
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.plural, "pods");
    }

    #[test]
    fn api_status_codes_map_to_fetch_errors() {
        let status = |code: u16| ErrorResponse { status: "Failure".into(), message: format!("code {}", code), reason: String::new(), code };
        assert_eq!(fetch_error(kube::Error::Api(status(404))), FetchError::NotFound("code 404".into()));
        assert_eq!(fetch_error(kube::Error::Api(status(403))), FetchError::Forbidden("code 403".into()));
        assert!(matches!(fetch_error(kube::Error::Api(status(500))), FetchError::Transport(_)));
    }

    fn pod(name: &str) -> DynamicObject {
        DynamicObject::new(name, &api_resource(KindTag::Pod)).within("demo")
    }

    fn summary(msgs: &[serde_json::Value]) -> Vec<(String, String)> {
        msgs.iter()
            .map(|m| (m["type"].as_str().unwrap_or("").to_string(), m["object"]["metadata"]["name"].as_str().unwrap_or("").to_string()))
            .collect()
    }

    #[test]
    fn watcher_events_become_wire_messages() {
        let mut feed = WireFeed::default();
        let msgs = feed.messages(Event::Applied(pod("web-1")));
        assert_eq!(summary(&msgs), vec![("ADDED".into(), "web-1".into())]);
        let ev = envwatch_core::decode_wire_value(KindTag::Pod, msgs[0].clone()).unwrap();
        assert_eq!(ev.resource().map(|r| r.namespace.as_str()), Some("demo"));

        let msgs = feed.messages(Event::Applied(pod("web-1")));
        assert_eq!(summary(&msgs), vec![("MODIFIED".into(), "web-1".into())]);
        let msgs = feed.messages(Event::Deleted(pod("web-1")));
        assert_eq!(summary(&msgs), vec![("DELETED".into(), "web-1".into())]);
    }

    #[test]
    fn relist_after_resume_deletes_vanished_names() {
        let mut feed = WireFeed::default();
        let first = feed.messages(Event::Restarted(vec![pod("a"), pod("b")]));
        assert_eq!(summary(&first), vec![("ADDED".into(), "a".into()), ("ADDED".into(), "b".into())]);

        // "a" went away while the watch was down, "c" appeared
        let msgs = feed.messages(Event::Restarted(vec![pod("b"), pod("c")]));
        assert_eq!(
            summary(&msgs),
            vec![("DELETED".into(), "a".into()), ("MODIFIED".into(), "b".into()), ("ADDED".into(), "c".into())]
        );
        for m in msgs {
            assert!(envwatch_core::decode_wire_value(KindTag::Pod, m).is_ok());
        }
    }

    #[test]
    fn only_gone_errors_are_left_to_the_watcher() {
        let status = |code: u16| ErrorResponse { status: "Failure".into(), message: "expired".into(), reason: "Expired".into(), code };
        assert!(relists(&watcher::Error::WatchError(status(410))));
        assert!(!relists(&watcher::Error::WatchError(status(500))));
    }

    #[test]
    fn environments_parse_from_yaml_values() {
        let mut data = BTreeMap::new();
        data.insert("stage".to_string(), "name: Stage\nnamespace: demo-stage\norder: 1\n".to_string());
        data.insert("run".to_string(), "name: Run\nnamespace: demo-run\norder: 2\n".to_string());
        data.insert("broken".to_string(), "- not an environment".to_string());
        let envs = Space::new("demo", environments_from_data(&data)).environments;
        let names: Vec<_> = envs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Stage", "Run"]);
    }
}
