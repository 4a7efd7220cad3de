//! Redeploy config change controller.
//!
//! Watches deployment configs and asks the change strategy for a new version
//! only when a config with a `ConfigChange` trigger is either undeployed or
//! its pod template drifted from what the latest deployment was built from.

#![forbid(unsafe_code)]

use std::time::Instant;

use k8s_openapi::api::core::v1::PodSpec;
use metrics::{counter, histogram};
use redeploy_core::{
    latest_deployment_name, pod_specs_equal, ChangeStrategy, ConfigCodec, Deployment, DeploymentConfig,
    DeploymentDetails, DeploymentLookup, DeploymentTriggerType,
};
use serde::Serialize;
use tracing::{debug, info, warn};

mod event_loop;

pub use event_loop::{stop_channel, StopHandle, StopSignal};

/// Structural equality predicate over pod specs.
pub type PodSpecEquality = fn(&PodSpec, &PodSpec) -> bool;

/// Why a config change did not lead to a new version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoChangeTrigger,
    /// The config claims a version whose deployment is not in the cache yet.
    DeploymentNotFound,
    TemplateUnchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    Generate,
    Update,
}

/// Terminal state of one reconciliation. Informational only: the loop moves on
/// to the next event regardless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Skipped { reason: SkipReason },
    Committed { latest_version: i64 },
    Conflicted,
    Failed { stage: FailedStage },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Skipped { .. } => "skipped",
            Outcome::Committed { .. } => "committed",
            Outcome::Conflicted => "conflicted",
            Outcome::Failed { .. } => "failed",
        }
    }

    fn skipped(reason: SkipReason) -> Self { Outcome::Skipped { reason } }
}

/// Decides, per changed config, whether a new deployment version is needed.
pub struct ConfigChangeController<S, L, C> {
    strategy: S,
    deployments: L,
    codec: C,
    pod_specs_equal: PodSpecEquality,
}

impl<S, L, C> ConfigChangeController<S, L, C>
where
    S: ChangeStrategy,
    L: DeploymentLookup,
    C: ConfigCodec,
{
    pub fn new(strategy: S, deployments: L, codec: C) -> Self {
        Self { strategy, deployments, codec, pod_specs_equal }
    }

    pub fn with_pod_spec_equality(mut self, eq: PodSpecEquality) -> Self {
        self.pod_specs_equal = eq;
        self
    }

    pub fn strategy(&self) -> &S { &self.strategy }

    /// Reconcile a single changed config. Never fails: every error is logged
    /// and reflected in the returned [`Outcome`].
    pub async fn handle_config(&self, config: &DeploymentConfig) -> Outcome {
        let started = Instant::now();
        counter!("redeploy_events_total", 1u64);
        let outcome = self.reconcile(config).await;
        histogram!("redeploy_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("redeploy_outcomes_total", 1u64, "outcome" => outcome.label());
        outcome
    }

    async fn reconcile(&self, config: &DeploymentConfig) -> Outcome {
        if !config.has_config_change_trigger() {
            debug!(ns = %config.namespace(), name = %config.name(), "config has no change trigger; skipping");
            return Outcome::skipped(SkipReason::NoChangeTrigger);
        }

        if config.latest_version() == 0 {
            debug!(ns = %config.namespace(), name = %config.name(), "creating first deployment for config");
            return self.regenerate(config, None).await;
        }

        let deployment_name = latest_deployment_name(config);
        let Some(deployment) = self.deployments.get(config.namespace(), &deployment_name) else {
            debug!(ns = %config.namespace(), deployment = %deployment_name, "ignoring config change; latest deployment not observed yet");
            return Outcome::skipped(SkipReason::DeploymentNotFound);
        };

        match self.codec.decode(&deployment) {
            Ok(deployed) => {
                if self.templates_equal(config, &deployed) {
                    debug!(
                        name = %config.name(),
                        latest_version = config.latest_version(),
                        deployment = %deployment_name,
                        "ignoring updated config; pod template matches deployed config"
                    );
                    return Outcome::skipped(SkipReason::TemplateUnchanged);
                }
            }
            // Unreadable snapshot: assume drift rather than risk dropping a real change.
            Err(e) => {
                counter!("redeploy_decode_errors_total", 1u64);
                warn!(deployment = %deployment_name, error = %e, "decoding deployed config failed; assuming drift");
            }
        }

        self.regenerate(config, Some(&deployment)).await
    }

    fn templates_equal(&self, proposed: &DeploymentConfig, deployed: &DeploymentConfig) -> bool {
        let empty = PodSpec::default();
        let a = proposed.pod_spec().unwrap_or(&empty);
        let b = deployed.pod_spec().unwrap_or(&empty);
        (self.pod_specs_equal)(a, b)
    }

    async fn regenerate(&self, config: &DeploymentConfig, deployment: Option<&Deployment>) -> Outcome {
        let (ns, name) = (config.namespace(), config.name());
        let mut next = match self.strategy.generate_config(ns, name).await {
            Ok(c) => c,
            Err(e) => {
                info!(ns = %ns, name = %name, error = %e, "generating new config version failed");
                return Outcome::Failed { stage: FailedStage::Generate };
            }
        };

        if let Some(d) = deployment {
            debug!(
                name = %name,
                from = config.latest_version(),
                to = next.latest_version(),
                deployment = %d.metadata.name.as_deref().unwrap_or(""),
                "updating config to advance existing deployment"
            );
        }

        next.status.details = Some(DeploymentDetails::caused_by(DeploymentTriggerType::ConfigChange));

        // Conditional write. A newer config already persisted by someone else
        // arrives as its own event, so a rejected write is simply dropped.
        match self.strategy.update_config(ns, &next).await {
            Ok(updated) => {
                info!(ns = %ns, name = %name, latest_version = updated.latest_version(), "config advanced on config change");
                Outcome::Committed { latest_version: updated.latest_version() }
            }
            Err(e) if e.is_conflict() => {
                info!(ns = %ns, name = %name, error = %e, "config update lost a race; waiting for the next event");
                Outcome::Conflicted
            }
            Err(e) => {
                info!(ns = %ns, name = %name, error = %e, "updating config failed");
                Outcome::Failed { stage: FailedStage::Update }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
    use redeploy_core::{DeploymentCause, DeploymentTrigger, StrategyError};

    #[derive(Default)]
    struct Recorder {
        generated: Mutex<Vec<(String, String)>>,
        updated: Mutex<Vec<DeploymentConfig>>,
        fail_generate: bool,
    }

    #[async_trait::async_trait]
    impl ChangeStrategy for Recorder {
        async fn generate_config(&self, namespace: &str, name: &str) -> Result<DeploymentConfig, StrategyError> {
            self.generated.lock().unwrap().push((namespace.to_string(), name.to_string()));
            if self.fail_generate {
                return Err(StrategyError::Api("boom".into()));
            }
            let mut c = DeploymentConfig::new(namespace, name);
            c.status.latest_version = 1;
            c.status.details = Some(DeploymentDetails {
                message: Some("stale".into()),
                causes: vec![DeploymentCause { kind: DeploymentTriggerType::Manual }],
            });
            Ok(c)
        }

        async fn update_config(&self, _namespace: &str, config: &DeploymentConfig) -> Result<DeploymentConfig, StrategyError> {
            self.updated.lock().unwrap().push(config.clone());
            Ok(config.clone())
        }
    }

    struct NoDeployments;

    impl DeploymentLookup for NoDeployments {
        fn get(&self, _namespace: &str, _name: &str) -> Option<Arc<Deployment>> { None }
    }

    fn config(triggers: Vec<DeploymentTrigger>, version: i64) -> DeploymentConfig {
        let mut c = DeploymentConfig::new("ns", "app");
        c.spec.triggers = triggers;
        c.status.latest_version = version;
        c.spec.template = Some(PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container { name: "web".into(), image: Some("nginx:1".into()), ..Default::default() }],
                ..Default::default()
            }),
        });
        c
    }

    fn controller(strategy: Recorder) -> ConfigChangeController<Recorder, NoDeployments, redeploy_core::JsonAnnotationCodec> {
        ConfigChangeController::new(strategy, NoDeployments, redeploy_core::JsonAnnotationCodec)
    }

    #[tokio::test]
    async fn image_only_triggers_are_ignored() {
        let ctl = controller(Recorder::default());
        let out = ctl.handle_config(&config(vec![DeploymentTrigger::ImageChange { params: None }], 0)).await;
        assert_eq!(out, Outcome::Skipped { reason: SkipReason::NoChangeTrigger });
        assert!(ctl.strategy().generated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_generation_overwrites_causes() {
        let ctl = controller(Recorder::default());
        let out = ctl.handle_config(&config(vec![DeploymentTrigger::ConfigChange], 0)).await;
        assert_eq!(out, Outcome::Committed { latest_version: 1 });
        let updated = ctl.strategy().updated.lock().unwrap();
        assert_eq!(updated.len(), 1);
        let details = updated[0].status.details.as_ref().unwrap();
        assert_eq!(details.causes, vec![DeploymentCause { kind: DeploymentTriggerType::ConfigChange }]);
        assert!(details.message.is_none());
    }

    #[tokio::test]
    async fn generation_failure_skips_update() {
        let ctl = controller(Recorder { fail_generate: true, ..Default::default() });
        let out = ctl.handle_config(&config(vec![DeploymentTrigger::ConfigChange], 0)).await;
        assert_eq!(out, Outcome::Failed { stage: FailedStage::Generate });
        assert_eq!(ctl.strategy().generated.lock().unwrap().len(), 1);
        assert!(ctl.strategy().updated.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_templates_compare_equal() {
        let ctl = controller(Recorder::default());
        let a = DeploymentConfig::new("ns", "app");
        let b = DeploymentConfig::new("ns", "app");
        assert!(ctl.templates_equal(&a, &b));
        assert!(!ctl.templates_equal(&config(vec![], 1), &b));
    }

    #[test]
    fn custom_equality_is_used() {
        fn always(_: &PodSpec, _: &PodSpec) -> bool { true }
        let ctl = controller(Recorder::default()).with_pod_spec_equality(always);
        assert!(ctl.templates_equal(&config(vec![], 1), &DeploymentConfig::new("ns", "app")));
    }
}
