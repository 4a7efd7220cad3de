//! Change strategy backed by the API server.

use kube::{api::PostParams, Client};
use redeploy_core::{ChangeStrategy, DeploymentConfig, StrategyError};
use tracing::debug;

use crate::{config_api, config_from_dynamic};

/// Generates the next version from the live object and writes it back through
/// the status subresource. The write carries the resourceVersion that was
/// read, so the API server rejects it if anyone wrote in between.
#[derive(Clone)]
pub struct KubeChangeStrategy {
    client: Client,
}

impl KubeChangeStrategy {
    pub fn new(client: Client) -> Self { Self { client } }
}

pub(crate) fn map_kube_error(e: kube::Error) -> StrategyError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StrategyError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => StrategyError::NotFound(ae.message),
        kube::Error::Api(ae) => StrategyError::Api(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        other => StrategyError::Other(other.into()),
    }
}

/// Full object for a status PUT. The status subresource replaces all of
/// `status`, so fields owned by other writers travel in `extra`.
pub(crate) fn status_body(config: &DeploymentConfig) -> Result<Vec<u8>, StrategyError> {
    let mut body = config.clone();
    body.api_version.get_or_insert_with(|| redeploy_core::API_VERSION.to_string());
    body.kind.get_or_insert_with(|| redeploy_core::KIND.to_string());
    serde_json::to_vec(&body).map_err(|e| StrategyError::Other(e.into()))
}

#[async_trait::async_trait]
impl ChangeStrategy for KubeChangeStrategy {
    async fn generate_config(&self, namespace: &str, name: &str) -> Result<DeploymentConfig, StrategyError> {
        let api = config_api(self.client.clone(), Some(namespace));
        let live = api.get(name).await.map_err(map_kube_error)?;
        let mut next = config_from_dynamic(&live)?;
        next.status.latest_version += 1;
        debug!(ns = %namespace, name = %name, latest_version = next.latest_version(), "generated next config version");
        Ok(next)
    }

    async fn update_config(&self, namespace: &str, config: &DeploymentConfig) -> Result<DeploymentConfig, StrategyError> {
        let api = config_api(self.client.clone(), Some(namespace));
        let data = status_body(config)?;
        let stored = api
            .replace_status(config.name(), &PostParams::default(), data)
            .await
            .map_err(map_kube_error)?;
        Ok(config_from_dynamic(&stored)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{DynamicObject, ErrorResponse};
    use redeploy_core::{DeploymentDetails, DeploymentTriggerType};

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn conflict_maps_to_conflict() {
        let e = map_kube_error(api_err(409, "Conflict"));
        assert!(e.is_conflict());
    }

    #[test]
    fn not_found_and_other_api_errors_are_not_conflicts() {
        assert!(matches!(map_kube_error(api_err(404, "NotFound")), StrategyError::NotFound(_)));
        match map_kube_error(api_err(500, "InternalError")) {
            StrategyError::Api(msg) => assert!(msg.contains("500")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn status_body_keeps_fields_owned_by_others() {
        let live: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps.openshift.io/v1",
            "kind": "DeploymentConfig",
            "metadata": { "name": "app", "namespace": "ns", "resourceVersion": "12" },
            "spec": {
                "strategy": { "type": "Rolling" },
                "triggers": [ { "type": "ConfigChange" } ]
            },
            "status": {
                "latestVersion": 4,
                "observedGeneration": 7,
                "replicas": 2,
                "conditions": [ { "type": "Progressing", "status": "True" } ]
            }
        }))
        .unwrap();
        let mut next = config_from_dynamic(&live).unwrap();
        next.status.latest_version += 1;
        next.status.details = Some(DeploymentDetails::caused_by(DeploymentTriggerType::ConfigChange));

        let body: serde_json::Value = serde_json::from_slice(&status_body(&next).unwrap()).unwrap();
        assert_eq!(body["metadata"]["resourceVersion"], "12");
        assert_eq!(body["spec"]["strategy"]["type"], "Rolling");
        let status = &body["status"];
        assert_eq!(status["latestVersion"], 5);
        assert_eq!(status["observedGeneration"], 7);
        assert_eq!(status["replicas"], 2);
        assert_eq!(status["conditions"][0]["type"], "Progressing");
        assert_eq!(status["details"]["causes"][0]["type"], "ConfigChange");
    }

    #[test]
    fn status_body_fills_type_meta() {
        let mut c = DeploymentConfig::new("ns", "app");
        c.api_version = None;
        c.kind = None;
        let body: serde_json::Value = serde_json::from_slice(&status_body(&c).unwrap()).unwrap();
        assert_eq!(body["apiVersion"], "apps.openshift.io/v1");
        assert_eq!(body["kind"], "DeploymentConfig");
    }
}
