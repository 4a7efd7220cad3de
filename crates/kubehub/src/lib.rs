//! Redeploy kubehub: list+watch wiring for deployment configs and their
//! replication controllers, plus the cluster-backed change strategy.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::ReplicationController;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use redeploy_core::{DeploymentConfig, DeploymentDelta};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod strategy;

pub use strategy::KubeChangeStrategy;

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

pub fn config_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("apps.openshift.io", "v1", redeploy_core::KIND))
}

/// DeploymentConfig API, namespaced when `namespace` is given.
pub fn config_api(client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = config_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    }
}

pub fn config_from_dynamic(obj: &DynamicObject) -> Result<DeploymentConfig> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    serde_json::from_value(raw).context("parsing DeploymentConfig")
}

/// List+watch deployment configs and forward every applied object to the
/// controller. Watch errors are retried with backoff; returns `Ok` once the
/// receiving side is gone.
pub async fn start_config_watcher(client: Client, namespace: Option<&str>, config_tx: mpsc::Sender<DeploymentConfig>) -> Result<()> {
    let api = config_api(client, namespace);
    info!(ns = ?namespace, "deployment config watcher started");
    forward_configs(watcher::watcher(api, watcher::Config::default()).default_backoff(), config_tx).await
}

async fn forward_configs<S>(stream: S, config_tx: mpsc::Sender<DeploymentConfig>) -> Result<()>
where
    S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let objs = match item {
            Ok(Event::Applied(o)) => vec![o],
            // deletions never need a new deployment
            Ok(Event::Deleted(_)) => continue,
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "config watch restart");
                list
            }
            Err(e) => {
                counter!("redeploy_watch_errors_total", 1u64, "watch" => "configs");
                warn!(error = %e, "config watch error; retrying");
                continue;
            }
        };
        for o in objs.iter() {
            let config = match config_from_dynamic(o) {
                Ok(c) => c,
                Err(e) => {
                    counter!("redeploy_config_parse_errors_total", 1u64);
                    warn!(name = ?o.metadata.name, error = %e, "skipping unparsable deployment config");
                    continue;
                }
            };
            if config_tx.send(config).await.is_err() {
                info!("config receiver dropped; stopping config watcher");
                return Ok(());
            }
        }
    }
    Err(anyhow!("config watch stream ended"))
}

/// List+watch replication controllers and feed them to the deployment cache.
/// Watch errors are retried with backoff; returns `Ok` once the cache is gone.
pub async fn start_deployment_watcher(client: Client, namespace: Option<&str>, delta_tx: mpsc::Sender<DeploymentDelta>) -> Result<()> {
    let api: Api<ReplicationController> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    info!(ns = ?namespace, "deployment watcher started");
    forward_deployments(watcher::watcher(api, watcher::Config::default()).default_backoff(), delta_tx).await
}

async fn forward_deployments<S>(stream: S, delta_tx: mpsc::Sender<DeploymentDelta>) -> Result<()>
where
    S: Stream<Item = Result<Event<ReplicationController>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let delta = match item {
            Ok(Event::Applied(o)) => DeploymentDelta::Applied(o),
            Ok(Event::Deleted(o)) => DeploymentDelta::Deleted(o),
            Ok(Event::Restarted(list)) => DeploymentDelta::Restarted(list),
            Err(e) => {
                counter!("redeploy_watch_errors_total", 1u64, "watch" => "deployments");
                warn!(error = %e, "deployment watch error; retrying");
                continue;
            }
        };
        if delta_tx.send(delta).await.is_err() {
            info!("delta receiver dropped; stopping deployment watcher");
            return Ok(());
        }
    }
    Err(anyhow!("deployment watch stream ended"))
}
