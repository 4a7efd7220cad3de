//! Redeploy core types: deployment configs, deployed revisions and the
//! collaborator traits the config change controller is built against.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod error;

pub use codec::{deployment_for_config, ConfigCodec, JsonAnnotationCodec};
pub use error::{DecodeError, StrategyError};

/// A deployed revision. Each config version materializes as one replication controller.
pub type Deployment = ReplicationController;

pub const API_VERSION: &str = "apps.openshift.io/v1";
pub const KIND: &str = "DeploymentConfig";

/// User-declared desired state: triggers plus a pod template, versioned by
/// `status.latestVersion`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeploymentConfigSpec,
    #[serde(default)]
    pub status: DeploymentConfigStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigSpec {
    /// Evaluated in order; the first `ConfigChange` entry wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<DeploymentTrigger>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
    /// Fields this model does not interpret (strategy, paused, ...), kept so writes round-trip them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigStatus {
    /// 0 means the config was never deployed.
    #[serde(default)]
    pub latest_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<DeploymentDetails>,
    /// Status owned by other writers (observedGeneration, replicas, conditions, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Declarative rule describing what causes a new deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeploymentTrigger {
    ConfigChange,
    ImageChange {
        #[serde(rename = "imageChangeParams", default, skip_serializing_if = "Option::is_none")]
        params: Option<ImageChangeParams>,
    },
    /// Trigger types this controller does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageChangeParams {
    #[serde(default)]
    pub automatic: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ImageReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageReference {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentTriggerType {
    ConfigChange,
    ImageChange,
    Manual,
    /// Cause types this controller does not know about.
    #[serde(other)]
    Unknown,
}

/// Provenance of the latest deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub causes: Vec<DeploymentCause>,
}

impl DeploymentDetails {
    /// Details carrying exactly one cause of the given type.
    pub fn caused_by(kind: DeploymentTriggerType) -> Self {
        Self { message: None, causes: vec![DeploymentCause { kind }] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentCause {
    #[serde(rename = "type")]
    pub kind: DeploymentTriggerType,
}

impl DeploymentConfig {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            api_version: Some(API_VERSION.to_string()),
            kind: Some(KIND.to_string()),
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }
    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn latest_version(&self) -> i64 { self.status.latest_version }

    /// True when any trigger reacts to config changes.
    pub fn has_config_change_trigger(&self) -> bool {
        self.spec.triggers.iter().any(|t| matches!(t, DeploymentTrigger::ConfigChange))
    }

    pub fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.template.as_ref().and_then(|t| t.spec.as_ref())
    }

    pub fn causes(&self) -> &[DeploymentCause] {
        self.status.details.as_ref().map(|d| d.causes.as_slice()).unwrap_or(&[])
    }
}

/// Name of the deployment materializing `version` of config `name`.
pub fn deployment_name(config_name: &str, version: i64) -> String {
    format!("{}-{}", config_name, version)
}

/// Name of the deployment for the config's current `latestVersion`.
pub fn latest_deployment_name(config: &DeploymentConfig) -> String {
    deployment_name(config.name(), config.latest_version())
}

/// Deep structural equality over pod specs.
pub fn pod_specs_equal(a: &PodSpec, b: &PodSpec) -> bool {
    a == b
}

/// Keyed lookup of last-known deployments. Implementations may be eventually consistent.
pub trait DeploymentLookup: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>>;
}

impl<T: DeploymentLookup + ?Sized> DeploymentLookup for Arc<T> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        (**self).get(namespace, name)
    }
}

/// Generates and persists config revisions. `update_config` must be a
/// conditional write that fails with [`StrategyError::Conflict`] on a stale version.
#[async_trait::async_trait]
pub trait ChangeStrategy: Send + Sync {
    async fn generate_config(&self, namespace: &str, name: &str) -> Result<DeploymentConfig, StrategyError>;
    async fn update_config(&self, namespace: &str, config: &DeploymentConfig) -> Result<DeploymentConfig, StrategyError>;
}

#[async_trait::async_trait]
impl<T: ChangeStrategy + ?Sized> ChangeStrategy for Arc<T> {
    async fn generate_config(&self, namespace: &str, name: &str) -> Result<DeploymentConfig, StrategyError> {
        (**self).generate_config(namespace, name).await
    }

    async fn update_config(&self, namespace: &str, config: &DeploymentConfig) -> Result<DeploymentConfig, StrategyError> {
        (**self).update_config(namespace, config).await
    }
}

/// Change to a deployment as observed by a watch stream.
#[derive(Debug, Clone)]
pub enum DeploymentDelta {
    Applied(Deployment),
    Deleted(Deployment),
    /// Full relist; replaces everything known so far.
    Restarted(Vec<Deployment>),
}
