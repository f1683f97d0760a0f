//! Reconcile lifecycle tests against the in-memory cluster.

mod util;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use cli::apply::{Action, ApplyOptions, apply};
use cli::delete::{DeleteOptions, delete};
use cli::diff::{DiffState, diff};
use cli::inventory::InventoryStore;
use cli::status::{StatusOptions, status};
use model::inventory::InventoryEntry;
use model::{ModuleMetadata, ReleaseMetadata, Resource};
use util::FakeCluster;

fn release(name: &str, namespace: &str) -> ReleaseMetadata {
    let module = ModuleMetadata {
        name: "blog".into(),
        fqn: "example.com/blog@v0#Blog".into(),
        version: "0.1.0".into(),
        default_namespace: namespace.into(),
        labels: Default::default(),
        uuid: model::meta::module_id("example.com/blog@v0#Blog", "0.1.0"),
    };
    ReleaseMetadata::new(name, namespace, &module)
}

fn deployment(name: &str, namespace: &str, component: &str) -> Resource {
    Resource::from_object(
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": namespace},
            "spec": {"replicas": 1},
        }),
        component,
        "kubernetes#deployment",
    )
    .expect("valid object")
}

fn service(name: &str, namespace: &str, component: &str) -> Resource {
    Resource::from_object(
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "namespace": namespace},
            "spec": {"ports": [{"port": 80}]},
        }),
        component,
        "kubernetes#service",
    )
    .expect("valid object")
}

#[tokio::test]
async fn apply_creates_and_short_circuits_on_identical_digest() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();
    let resources = vec![
        deployment("blog-web", "default", "web"),
        service("blog-web", "default", "web"),
    ];

    let summary = apply(
        &cluster,
        resources.clone(),
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");
    assert_eq!(summary.created, 2);
    assert!(!summary.failed());
    // The inventory secret is on the cluster alongside the resources.
    assert_eq!(cluster.len(), 3, "objects: {:?}", cluster.names());

    // Unchanged render: digest matches, nothing is written.
    let again = apply(
        &cluster,
        resources,
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");
    assert!(again.short_circuited);
    assert_eq!(again.created, 0);
}

#[tokio::test]
async fn apply_continues_past_per_resource_failure() {
    let cluster = FakeCluster::new();
    cluster.deny("blog-b");
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();
    // Equal weights keep the given order: a, b, c.
    let resources = vec![
        deployment("blog-a", "default", "a"),
        deployment("blog-b", "default", "b"),
        deployment("blog-c", "default", "c"),
    ];

    let summary = apply(
        &cluster,
        resources,
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");
    assert_eq!(summary.created, 2);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].1.contains("denied"));
    // The third resource was still attempted and created.
    assert!(cluster.contains("Deployment", "default", "blog-c"));
    assert!(!cluster.contains("Deployment", "default", "blog-b"));
    let actions: Vec<&Action> = summary.outcomes.iter().map(|o| &o.action).collect();
    assert!(matches!(actions[0], Action::Created));
    assert!(matches!(actions[1], Action::Failed(_)));
    assert!(matches!(actions[2], Action::Created));
}

#[tokio::test]
async fn component_rename_is_not_an_orphan() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();

    apply(
        &cluster,
        vec![deployment("blog-frontend", "default", "web")],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("first apply");

    // Same Kubernetes object, new component name.
    let summary = apply(
        &cluster,
        vec![deployment("blog-frontend", "default", "frontend")],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("second apply");
    assert_eq!(
        summary.renames,
        vec![("web".to_string(), "frontend".to_string())]
    );
    // The renamed deployment must survive the stale sweep.
    assert!(cluster.contains("Deployment", "default", "blog-frontend"));
    assert_eq!(summary.stale_deleted, 0);

    let store = InventoryStore::new(&cluster);
    let inv = store
        .get("blog", "default", Some(&rel.identity))
        .await
        .expect("get")
        .expect("present");
    assert_eq!(inv.entries.len(), 1);
    assert_eq!(inv.entries[0].component, "frontend");
}

#[tokio::test]
async fn stale_resources_are_removed_on_the_next_apply() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();

    apply(
        &cluster,
        vec![
            deployment("blog-web", "default", "web"),
            service("blog-web", "default", "web"),
        ],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("first apply");

    // The next render no longer produces the Service.
    let summary = apply(
        &cluster,
        vec![deployment("blog-web", "default", "web")],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("second apply");
    assert_eq!(summary.stale_deleted, 1);
    assert!(!cluster.contains("Service", "default", "blog-web"));
}

#[tokio::test]
async fn delete_reverses_apply_and_tolerates_missing() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();
    apply(
        &cluster,
        vec![
            deployment("blog-web", "default", "web"),
            service("blog-web", "default", "web"),
        ],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");

    let summary = delete(
        &cluster,
        Some("blog"),
        None,
        "default",
        &DeleteOptions::default(),
        &cancel,
    )
    .await
    .expect("delete");
    assert_eq!(summary.deleted, 2);
    assert!(summary.inventory_deleted);
    assert_eq!(cluster.len(), 0, "objects left: {:?}", cluster.names());
    // Workloads (weight 100) are deleted before services (weight 50).
    assert_eq!(summary.records[0].entry.kind, "Deployment");
    assert_eq!(summary.records[1].entry.kind, "Service");
}

/// Seeds an applied release whose deployment carries a finalizer.
async fn finalized_release(cluster: &FakeCluster) -> ReleaseMetadata {
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();
    apply(
        cluster,
        vec![deployment("blog-web", "default", "web")],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");
    cluster.insert(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "blog-web",
            "namespace": "default",
            "finalizers": ["example.com/guard"],
        },
        "spec": {"replicas": 1},
    }));
    rel
}

#[tokio::test]
async fn delete_surfaces_finalizer_lockups() {
    let cluster = FakeCluster::new();
    finalized_release(&cluster).await;
    let cancel = CancellationToken::new();

    let summary = delete(
        &cluster,
        Some("blog"),
        None,
        "default",
        &DeleteOptions::default(),
        &cancel,
    )
    .await
    .expect("delete");
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.errors.len(), 1);
    assert!(
        summary.errors[0].1.contains("example.com/guard"),
        "got: {:?}",
        summary.errors
    );
    // The resource is stuck terminating and the inventory stays for a
    // retry.
    assert!(!summary.inventory_deleted);
    assert!(cluster.contains("Deployment", "default", "blog-web"));
}

#[tokio::test]
async fn force_delete_strips_finalizers_first() {
    let cluster = FakeCluster::new();
    finalized_release(&cluster).await;
    let cancel = CancellationToken::new();

    let summary = delete(
        &cluster,
        Some("blog"),
        None,
        "default",
        &DeleteOptions {
            force: true,
            ..Default::default()
        },
        &cancel,
    )
    .await
    .expect("delete");
    assert_eq!(summary.deleted, 1);
    assert!(summary.errors.is_empty(), "errors: {:?}", summary.errors);
    assert!(summary.inventory_deleted);
    assert!(!cluster.contains("Deployment", "default", "blog-web"));
    assert_eq!(cluster.len(), 0, "objects left: {:?}", cluster.names());
}

#[tokio::test]
async fn delete_of_a_never_applied_release_is_not_found() {
    let cluster = FakeCluster::new();
    let cancel = CancellationToken::new();
    let err = delete(
        &cluster,
        Some("ghost"),
        None,
        "default",
        &DeleteOptions::default(),
        &cancel,
    )
    .await
    .expect_err("not found");
    assert!(matches!(err, cli::Error::ReleaseNotFound(_)));
    assert_eq!(err.exit_code(), cli::exit::NOT_FOUND);

    // --ignore-not-found collapses the failure to success.
    let summary = delete(
        &cluster,
        Some("ghost"),
        None,
        "default",
        &DeleteOptions {
            ignore_not_found: true,
            ..Default::default()
        },
        &cancel,
    )
    .await
    .expect("ignored");
    assert_eq!(summary.deleted, 0);
}

#[tokio::test]
async fn reapply_after_delete_restores_the_same_set() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();
    let render = || {
        vec![
            deployment("blog-web", "default", "web"),
            service("blog-web", "default", "web"),
        ]
    };

    apply(&cluster, render(), &rel, &ApplyOptions::default(), &cancel)
        .await
        .expect("apply");
    let before = cluster.names();
    delete(
        &cluster,
        Some("blog"),
        None,
        "default",
        &DeleteOptions::default(),
        &cancel,
    )
    .await
    .expect("delete");
    apply(&cluster, render(), &rel, &ApplyOptions::default(), &cancel)
        .await
        .expect("reapply");
    assert_eq!(cluster.names(), before);
}

#[tokio::test]
async fn diff_reports_orphans_from_the_prior_inventory() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();
    apply(
        &cluster,
        vec![
            deployment("blog-web", "default", "web"),
            service("blog-web", "default", "web"),
        ],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");

    let store = InventoryStore::new(&cluster);
    let prior = store
        .get("blog", "default", Some(&rel.identity))
        .await
        .expect("get")
        .expect("present");

    // The new render drops the Service and changes nothing else.
    let mut local = vec![deployment("blog-web", "default", "web")];
    for r in &mut local {
        let component = r.component.clone();
        r.set_labels(&model::tracking_labels(&rel, &component));
    }
    let report = diff(&cluster, &local, Some(&prior)).await.expect("diff");
    let states: Vec<(&str, &str)> = report
        .iter()
        .map(|e| (e.gvk.kind.as_str(), e.state.word()))
        .collect();
    assert!(states.contains(&("Service", "Orphaned")), "report: {states:?}");
    // The deployment differs only by tracking labels the first apply
    // already stamped, so it must not show as drift... unless the labels
    // differ; it was applied with the same labels, so Unchanged.
    assert!(states.contains(&("Deployment", "Unchanged")), "report: {states:?}");
}

#[tokio::test]
async fn status_aggregates_health_and_drills_into_pods() {
    let cluster = FakeCluster::new();
    let rel = release("jellyfin", "media");
    let cancel = CancellationToken::new();
    apply(
        &cluster,
        vec![deployment("jellyfin", "media", "server")],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");

    // Degrade the deployment: 1/3 ready, with a selector for pods.
    cluster.insert(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "jellyfin", "namespace": "media"},
        "spec": {"replicas": 3, "selector": {"matchLabels": {"app": "jellyfin"}}},
        "status": {"readyReplicas": 1},
    }));
    for (name, ready, reason, restarts) in [
        ("jellyfin-0", true, None, 0),
        ("jellyfin-1", true, None, 0),
        ("jellyfin-2", false, Some("OOMKilled"), 5),
    ] {
        let state = match reason {
            Some(r) => json!({"waiting": {"reason": r}}),
            None => json!({"running": {}}),
        };
        cluster.insert(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "media", "labels": {"app": "jellyfin"}},
            "status": {
                "phase": if ready { "Running" } else { "Pending" },
                "containerStatuses": [{"ready": ready, "restartCount": restarts, "state": state}],
            },
        }));
    }

    let report = status(
        &cluster,
        Some("jellyfin"),
        None,
        "media",
        &StatusOptions { verbose: true },
    )
    .await
    .expect("status");
    assert!(!report.ready);
    let dep = &report.resources[0];
    assert_eq!(dep.health.word(), "NotReady");
    assert_eq!(dep.pods.len(), 3);
    let broken = dep
        .pods
        .iter()
        .find(|p| p.name == "jellyfin-2")
        .expect("pod listed");
    assert_eq!(broken.reason.as_deref(), Some("OOMKilled"));
    assert_eq!(broken.restarts, 5);
}

#[tokio::test]
async fn status_of_missing_resources_is_not_ready() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let store = InventoryStore::new(&cluster);
    // Inventory exists but the resource was deleted out-of-band.
    store
        .put(
            &rel,
            vec![InventoryEntry {
                group: "apps".into(),
                kind: "Deployment".into(),
                namespace: "default".into(),
                name: "blog-web".into(),
                version: "v1".into(),
                component: "web".into(),
            }],
        )
        .await
        .expect("put");

    let report = status(
        &cluster,
        Some("blog"),
        None,
        "default",
        &StatusOptions::default(),
    )
    .await
    .expect("status");
    assert!(!report.ready);
    assert_eq!(report.resources.len(), 1);
    assert_eq!(
        report.resources[0].health,
        cli::status::Health::NotReady("not found".into())
    );
}

#[tokio::test]
async fn diff_modified_resources_render_a_readable_diff() {
    let cluster = FakeCluster::new();
    let rel = release("blog", "default");
    let cancel = CancellationToken::new();
    apply(
        &cluster,
        vec![deployment("blog-web", "default", "web")],
        &rel,
        &ApplyOptions::default(),
        &cancel,
    )
    .await
    .expect("apply");

    let mut changed = deployment("blog-web", "default", "web");
    changed.object["spec"]["replicas"] = json!(5);
    let component = changed.component.clone();
    changed.set_labels(&model::tracking_labels(&rel, &component));
    let report = diff(&cluster, &[changed], None).await.expect("diff");
    match &report[0].state {
        DiffState::Modified(text) => assert!(text.contains("replicas"), "got: {text}"),
        other => panic!("expected Modified, got {other:?}"),
    }
}
