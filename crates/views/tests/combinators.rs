#![forbid(unsafe_code)]

use std::sync::Arc;

use envwatch_core::{Collection, KindTag, Resource};
use envwatch_views::{
    combine_controllers, deployment_views, filter_by_space, find_view, plain, replica_views, ViewItem, TRACKED,
};

fn res(kind: KindTag, name: &str, spec: serde_json::Value) -> Arc<Resource> {
    let raw = serde_json::json!({ "metadata": { "name": name, "namespace": "ns" }, "spec": spec });
    Arc::new(Resource::from_raw(kind, raw).unwrap())
}

fn labelled(kind: KindTag, name: &str, labels: serde_json::Value) -> Arc<Resource> {
    let raw = serde_json::json!({ "metadata": { "name": name, "namespace": "ns", "labels": labels } });
    Arc::new(Resource::from_raw(kind, raw).unwrap())
}

fn coll(kind: KindTag, items: Vec<Arc<Resource>>) -> Collection {
    Collection { kind, namespace: "ns".into(), epoch: 1, items, fetch_error: None }
}

fn template(app: &str) -> serde_json::Value {
    serde_json::json!({ "template": { "metadata": { "labels": { "app": app } } } })
}

fn controller(item: &ViewItem) -> &envwatch_views::ControllerView {
    match item {
        ViewItem::Controller(v) => v,
        other => panic!("expected controller view, got {:?}", other),
    }
}

#[test]
fn deployment_config_shadows_same_named_deployment() {
    let deployments = coll(KindTag::Deployment, vec![res(KindTag::Deployment, "x", template("x"))]);
    let configs = coll(KindTag::DeploymentConfig, vec![res(KindTag::DeploymentConfig, "x", template("x"))]);
    let services = coll(KindTag::Service, vec![]);
    let out = deployment_views(&deployments, &configs, &services);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name(), "x");
    assert_eq!(out[0].kind(), KindTag::DeploymentConfig);
}

#[test]
fn controllers_keep_base_order_and_append_new_configs() {
    let base = vec![
        res(KindTag::Deployment, "a", template("a")),
        res(KindTag::Deployment, "b", template("b")),
    ];
    let config = vec![
        res(KindTag::DeploymentConfig, "c", template("c")),
        res(KindTag::DeploymentConfig, "a", template("a")),
    ];
    let merged = combine_controllers(&base, &config);
    let names: Vec<_> = merged.iter().map(|r| (r.name.as_str(), r.kind)).collect();
    assert_eq!(
        names,
        vec![("a", KindTag::DeploymentConfig), ("b", KindTag::Deployment), ("c", KindTag::DeploymentConfig)]
    );
}

#[test]
fn services_attach_by_selector() {
    let deployments = coll(
        KindTag::Deployment,
        vec![res(KindTag::Deployment, "web", template("web")), res(KindTag::Deployment, "db", template("db"))],
    );
    let services = coll(
        KindTag::Service,
        vec![
            res(KindTag::Service, "web-svc", serde_json::json!({ "selector": { "app": "web" } })),
            res(KindTag::Service, "other", serde_json::json!({ "selector": { "app": "web", "tier": "edge" } })),
            res(KindTag::Service, "headless", serde_json::json!({})),
        ],
    );
    let out = deployment_views(&deployments, &coll(KindTag::DeploymentConfig, vec![]), &services);
    let web = controller(&out[0]);
    assert_eq!(web.services.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["web-svc"]);
    assert!(controller(&out[1]).services.is_empty(), "no join partner leaves services unset");
}

#[test]
fn replica_view_uses_flat_selector_of_replication_controllers() {
    let rcs = coll(
        KindTag::ReplicationController,
        vec![res(KindTag::ReplicationController, "api-1", serde_json::json!({ "selector": { "app": "api" } }))],
    );
    let services = coll(
        KindTag::Service,
        vec![res(KindTag::Service, "api", serde_json::json!({ "selector": { "app": "api" } }))],
    );
    let out = replica_views(&coll(KindTag::ReplicaSet, vec![]), &rcs, &services);
    assert_eq!(out.len(), 1);
    assert_eq!(controller(&out[0]).services.len(), 1);
}

#[test]
fn combinators_tolerate_empty_and_missing_inputs() {
    let spec = find_view("deployments").unwrap();
    assert!((spec.combine)(&[]).is_empty());
    let only_deployments = Arc::new(coll(KindTag::Deployment, vec![res(KindTag::Deployment, "a", template("a"))]));
    let out = (spec.combine)(&[only_deployments]);
    assert_eq!(out.len(), 1);
    assert!(controller(&out[0]).services.is_empty());
}

#[test]
fn combinators_are_deterministic() {
    let d = Arc::new(coll(KindTag::Deployment, vec![res(KindTag::Deployment, "a", template("a"))]));
    let dc = Arc::new(coll(KindTag::DeploymentConfig, vec![res(KindTag::DeploymentConfig, "b", template("b"))]));
    let s = Arc::new(coll(KindTag::Service, vec![res(KindTag::Service, "a", serde_json::json!({ "selector": { "app": "a" } }))]));
    let spec = find_view("Deployment").unwrap();
    let inputs = [d, dc, s];
    assert_eq!((spec.combine)(&inputs), (spec.combine)(&inputs));
}

#[test]
fn space_label_filter() {
    let items = plain(&coll(
        KindTag::Pod,
        vec![
            labelled(KindTag::Pod, "shared", serde_json::json!({})),
            labelled(KindTag::Pod, "mine", serde_json::json!({ "space": "L" })),
            labelled(KindTag::Pod, "theirs", serde_json::json!({ "space": "other" })),
        ],
    ));
    let once = filter_by_space(items.clone(), Some("L"));
    let names: Vec<_> = once.iter().map(|i| i.name()).collect();
    assert_eq!(names, vec!["shared", "mine"]);
    assert_eq!(filter_by_space(once.clone(), Some("L")), once);
    assert_eq!(filter_by_space(items.clone(), None).len(), 3);
}

#[test]
fn tracked_table_titles() {
    let paths: Vec<_> = TRACKED.iter().map(|v| v.path).collect();
    assert_eq!(paths, vec!["deployments", "replicasets", "pods", "services", "configmaps", "events"]);
    let pods = find_view("pods").unwrap();
    assert_eq!(pods.default_title(), "Pods");
    assert_eq!(pods.title_for(0), "0 Pods");
    assert_eq!(pods.title_for(1), "1 Pod");
    assert_eq!(find_view("replicasets").unwrap().title_for(2), "2 Replicas");
}
