//! Offline reconciliation: run the controller once against manifests on disk,
//! with a strategy that records what would have been written.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use redeploy_controller::{ConfigChangeController, Outcome};
use redeploy_core::{
    deployment_for_config, ChangeStrategy, Deployment, DeploymentConfig, DeploymentDelta, JsonAnnotationCodec,
    StrategyError,
};
use redeploy_store::CacheBuilder;
use serde::Serialize;

fn read_manifest<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Generates `latestVersion + 1` of the given config and keeps the submitted update.
struct DryRunStrategy {
    base: DeploymentConfig,
    submitted: Mutex<Option<DeploymentConfig>>,
}

#[async_trait::async_trait]
impl ChangeStrategy for DryRunStrategy {
    async fn generate_config(&self, _namespace: &str, _name: &str) -> Result<DeploymentConfig, StrategyError> {
        let mut next = self.base.clone();
        next.status.latest_version += 1;
        Ok(next)
    }

    async fn update_config(&self, _namespace: &str, config: &DeploymentConfig) -> Result<DeploymentConfig, StrategyError> {
        if let Ok(mut slot) = self.submitted.lock() {
            *slot = Some(config.clone());
        }
        Ok(config.clone())
    }
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub config: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub would_submit: Option<DeploymentConfig>,
}

impl CheckReport {
    pub fn human(&self) -> String {
        let mut out = format!("{} • {}\n", self.config, self.outcome.label());
        match &self.outcome {
            Outcome::Skipped { reason } => out.push_str(&format!("  reason: {:?}\n", reason)),
            Outcome::Committed { latest_version } => out.push_str(&format!("  would advance to latestVersion {}\n", latest_version)),
            _ => {}
        }
        out
    }
}

pub async fn check(config_path: &Path, deployment_path: Option<&Path>) -> Result<CheckReport> {
    let config: DeploymentConfig = read_manifest(config_path)?;
    let mut cache = CacheBuilder::new();
    if let Some(p) = deployment_path {
        let mut deployment: Deployment = read_manifest(p)?;
        if deployment.metadata.namespace.is_none() {
            deployment.metadata.namespace = config.metadata.namespace.clone();
        }
        cache.apply(vec![DeploymentDelta::Applied(deployment)]);
    }

    let strategy = DryRunStrategy { base: config.clone(), submitted: Mutex::new(None) };
    let controller = ConfigChangeController::new(strategy, cache.freeze(), JsonAnnotationCodec);
    let outcome = controller.handle_config(&config).await;
    let would_submit = controller.strategy().submitted.lock().ok().and_then(|s| s.clone());
    Ok(CheckReport { config: format!("{}/{}", config.namespace(), config.name()), outcome, would_submit })
}

pub fn render(config_path: &Path) -> Result<Deployment> {
    let config: DeploymentConfig = read_manifest(config_path)?;
    deployment_for_config(&config, &JsonAnnotationCodec).context("encoding config snapshot")
}
