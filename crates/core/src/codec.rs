//! Snapshot codec: a deployment embeds the config it was generated from as
//! JSON in an annotation, so later config changes can be compared against it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ReplicationControllerSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{deployment_name, DecodeError, Deployment, DeploymentConfig};

pub const ENCODED_CONFIG_ANNOTATION: &str = "openshift.io/encoded-deployment-config";
pub const CONFIG_NAME_ANNOTATION: &str = "openshift.io/deployment-config.name";
pub const LATEST_VERSION_ANNOTATION: &str = "openshift.io/deployment-config.latest-version";

pub trait ConfigCodec: Send + Sync {
    fn encode(&self, config: &DeploymentConfig) -> Result<String, serde_json::Error>;
    fn decode(&self, deployment: &Deployment) -> Result<DeploymentConfig, DecodeError>;
}

/// Stores the snapshot as plain JSON under [`ENCODED_CONFIG_ANNOTATION`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAnnotationCodec;

impl ConfigCodec for JsonAnnotationCodec {
    fn encode(&self, config: &DeploymentConfig) -> Result<String, serde_json::Error> {
        serde_json::to_string(config)
    }

    fn decode(&self, deployment: &Deployment) -> Result<DeploymentConfig, DecodeError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let raw = deployment
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ENCODED_CONFIG_ANNOTATION))
            .ok_or_else(|| DecodeError::MissingAnnotation { deployment: name.clone(), annotation: ENCODED_CONFIG_ANNOTATION })?;
        serde_json::from_str(raw).map_err(|source| DecodeError::Malformed { deployment: name, source })
    }
}

/// Materialize the deployment for the config's current version, embedding
/// the encoded config for later drift checks.
pub fn deployment_for_config(config: &DeploymentConfig, codec: &dyn ConfigCodec) -> Result<Deployment, serde_json::Error> {
    let encoded = codec.encode(config)?;
    let mut annotations = BTreeMap::new();
    annotations.insert(ENCODED_CONFIG_ANNOTATION.to_string(), encoded);
    annotations.insert(CONFIG_NAME_ANNOTATION.to_string(), config.name().to_string());
    annotations.insert(LATEST_VERSION_ANNOTATION.to_string(), config.latest_version().to_string());

    let mut labels = config.metadata.labels.clone().unwrap_or_default();
    labels.insert(CONFIG_NAME_ANNOTATION.to_string(), config.name().to_string());

    let selector = if config.spec.selector.is_empty() { None } else { Some(config.spec.selector.clone()) };
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(config.name(), config.latest_version())),
            namespace: config.metadata.namespace.clone(),
            annotations: Some(annotations),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ReplicationControllerSpec {
            replicas: Some(config.spec.replicas),
            selector,
            template: config.spec.template.clone(),
            ..Default::default()
        }),
        status: None,
    })
}
