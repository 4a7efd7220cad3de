#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use redeploy_core::{Deployment, DeploymentDelta, DeploymentLookup};
use redeploy_store::{spawn_ingest, CacheBuilder};

fn rc(ns: &str, name: &str, rv: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn rv(d: &Deployment) -> &str { d.metadata.resource_version.as_deref().unwrap_or("") }

#[test]
fn replay_basic_sequence() {
    let mut cb = CacheBuilder::new();

    let deltas = vec![
        DeploymentDelta::Applied(rc("ns", "app-1", "1")),
        DeploymentDelta::Applied(rc("other", "app-1", "2")),
        // update in place
        DeploymentDelta::Applied(rc("ns", "app-1", "3")),
        DeploymentDelta::Deleted(rc("other", "app-1", "2")),
    ];

    cb.apply(deltas[..2].to_vec());
    let snap1 = cb.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.len(), 2);
    assert_eq!(rv(&snap1.get("ns", "app-1").unwrap()), "1");

    cb.apply(deltas[2..].to_vec());
    let snap2 = cb.freeze();
    assert_eq!(snap2.epoch, 2);
    assert_eq!(snap2.len(), 1);
    assert_eq!(rv(&snap2.get("ns", "app-1").unwrap()), "3");
    assert!(snap2.get("other", "app-1").is_none());

    // earlier snapshots are unaffected
    assert_eq!(snap1.len(), 2);
}

#[test]
fn restart_replaces_everything() {
    let mut cb = CacheBuilder::new();
    cb.apply(vec![DeploymentDelta::Applied(rc("ns", "stale-1", "1"))]);
    cb.apply(vec![DeploymentDelta::Restarted(vec![rc("ns", "app-1", "5"), rc("ns", "app-2", "6")])]);
    let snap = cb.freeze();
    assert_eq!(snap.len(), 2);
    assert!(snap.get("ns", "stale-1").is_none());
    assert!(snap.get("ns", "app-2").is_some());
}

#[test]
fn nameless_objects_are_ignored() {
    let mut cb = CacheBuilder::new();
    cb.apply(vec![DeploymentDelta::Applied(Deployment::default())]);
    let snap = cb.freeze();
    assert!(snap.is_empty());
    assert_eq!(snap.epoch, 1);
}

#[tokio::test]
async fn ingest_publishes_new_epochs() {
    let (tx, cache) = spawn_ingest(16);
    let mut epochs = cache.subscribe_epoch();
    assert!(cache.get("ns", "app-1").is_none());

    tx.send(DeploymentDelta::Applied(rc("ns", "app-1", "1"))).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), epochs.changed()).await.unwrap().unwrap();
    assert!(*epochs.borrow() >= 1);
    assert_eq!(rv(&cache.get("ns", "app-1").unwrap()), "1");

    tx.send(DeploymentDelta::Deleted(rc("ns", "app-1", "1"))).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), epochs.changed()).await.unwrap().unwrap();
    assert!(cache.get("ns", "app-1").is_none());
    assert_eq!(cache.current().epoch, *epochs.borrow());
}

#[test]
fn emptied_namespace_does_not_linger() {
    let mut cb = CacheBuilder::new();
    cb.apply(vec![
        DeploymentDelta::Applied(rc("a", "app-1", "1")),
        DeploymentDelta::Applied(rc("b", "app-1", "2")),
        DeploymentDelta::Applied(rc("b", "app-2", "3")),
    ]);
    assert_eq!(cb.freeze().namespaces(), 2);

    cb.apply(vec![
        DeploymentDelta::Deleted(rc("a", "app-1", "1")),
        // unknown names and namespaces are no-ops
        DeploymentDelta::Deleted(rc("a", "app-1", "1")),
        DeploymentDelta::Deleted(rc("c", "app-9", "1")),
    ]);
    let snap = cb.freeze();
    assert_eq!(snap.len(), 2);
    assert_eq!(snap.namespaces(), 1);
    assert!(snap.get("a", "app-1").is_none());
    assert_eq!(rv(&snap.get("b", "app-1").unwrap()), "2");

    // re-applying an existing name replaces rather than grows
    cb.apply(vec![DeploymentDelta::Applied(rc("b", "app-2", "4"))]);
    let snap = cb.freeze();
    assert_eq!(snap.len(), 2);
    assert_eq!(rv(&snap.get("b", "app-2").unwrap()), "4");
}
