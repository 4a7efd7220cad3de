//! Redeploy store: in-RAM cache of last-known deployments, fed by a watch
//! stream and read lock-free by the controller.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::counter;
use redeploy_core::{Deployment, DeploymentDelta, DeploymentLookup};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// namespace -> name -> deployment; lookups borrow `&str` keys without allocating.
type ByNamespace = FxHashMap<String, FxHashMap<String, Arc<Deployment>>>;

/// Immutable view of the cache at one epoch.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    items: ByNamespace,
    len: usize,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn namespaces(&self) -> usize { self.items.len() }
}

impl DeploymentLookup for CacheSnapshot {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.items.get(namespace)?.get(name).cloned()
    }
}

/// Builds [`CacheSnapshot`]s from deltas.
#[derive(Default)]
pub struct CacheBuilder {
    epoch: u64,
    items: ByNamespace,
    len: usize,
}

impl CacheBuilder {
    pub fn new() -> Self { Self::default() }

    fn insert(&mut self, d: Deployment) {
        let Some(name) = d.metadata.name.clone() else { return };
        let ns = d.metadata.namespace.clone().unwrap_or_default();
        if self.items.entry(ns).or_default().insert(name, Arc::new(d)).is_none() {
            self.len += 1;
        }
    }

    fn remove(&mut self, d: &Deployment) {
        let Some(name) = d.metadata.name.as_deref() else { return };
        let ns = d.metadata.namespace.as_deref().unwrap_or("");
        let Some(names) = self.items.get_mut(ns) else { return };
        if names.remove(name).is_some() {
            self.len -= 1;
        }
        if names.is_empty() {
            self.items.remove(ns);
        }
    }

    /// Apply a batch of deltas. Each call advances the epoch by one.
    pub fn apply(&mut self, batch: Vec<DeploymentDelta>) {
        for delta in batch {
            match delta {
                DeploymentDelta::Applied(d) => self.insert(d),
                DeploymentDelta::Deleted(d) => self.remove(&d),
                DeploymentDelta::Restarted(list) => {
                    debug!(count = list.len(), "deployment relist");
                    self.items.clear();
                    self.len = 0;
                    for d in list {
                        self.insert(d);
                    }
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, items: self.items.clone(), len: self.len })
    }
}

/// Read handle over the latest snapshot.
#[derive(Clone)]
pub struct DeploymentCache {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl DeploymentCache {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl DeploymentLookup for DeploymentCache {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.snap.load().get(namespace, name)
    }
}

/// Spawn the ingest loop. Every wakeup drains whatever is queued, applies it
/// as one batch and swaps in a new snapshot.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<DeploymentDelta>, DeploymentCache) {
    let (tx, mut rx) = mpsc::channel::<DeploymentDelta>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut builder = CacheBuilder::new();
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(more) = rx.try_recv() {
                batch.push(more);
            }
            counter!("redeploy_cache_applied_total", batch.len() as u64);
            builder.apply(batch);
            let next = builder.freeze();
            let epoch = next.epoch;
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
        }
        info!("deployment delta channel closed; ingest loop stopped");
    });

    (tx, DeploymentCache { snap, epoch_rx })
}
