//! Event loop: one reconciliation per received config, strictly sequential,
//! until stopped.

use redeploy_core::{ChangeStrategy, ConfigCodec, DeploymentConfig, DeploymentLookup};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{ConfigChangeController, Outcome};

/// Stops a running controller. Dropping the handle stops it as well.
#[derive(Debug)]
pub struct StopHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl StopHandle {
    pub fn stop(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Receiving side of a [`StopHandle`].
#[derive(Debug)]
pub struct StopSignal {
    rx: oneshot::Receiver<()>,
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = oneshot::channel();
    (StopHandle { tx: Some(tx) }, StopSignal { rx })
}

impl<S, L, C> ConfigChangeController<S, L, C>
where
    S: ChangeStrategy,
    L: DeploymentLookup,
    C: ConfigCodec,
{
    /// Wait for the next config and reconcile it. `None` once the source is closed.
    pub async fn handle_next(&self, configs: &mut mpsc::Receiver<DeploymentConfig>) -> Option<Outcome> {
        let config = configs.recv().await?;
        Some(self.handle_config(&config).await)
    }

    /// Run until `stop` fires or `configs` closes. The stop signal is only
    /// observed between reconciliations; a step in flight always completes.
    pub async fn run(self, mut configs: mpsc::Receiver<DeploymentConfig>, mut stop: StopSignal) {
        info!("config change controller started");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop.rx => {
                    info!("stop requested");
                    break;
                }
                next = configs.recv() => match next {
                    Some(config) => { self.handle_config(&config).await; }
                    None => {
                        info!("config source closed");
                        break;
                    }
                },
            }
        }
        info!("config change controller stopped");
    }

    /// Run on a background task.
    pub fn spawn(self, configs: mpsc::Receiver<DeploymentConfig>) -> (JoinHandle<()>, StopHandle)
    where
        S: 'static,
        L: 'static,
        C: 'static,
    {
        let (handle, signal) = stop_channel();
        (tokio::spawn(self.run(configs, signal)), handle)
    }
}
