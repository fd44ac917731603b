//! kube-trigger kubehub: kube-rs cluster client, `TriggerRule` resource and watch wiring

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use trigger_core::{ClusterClient, ClusterError, ClusterObject, KindSpec};

pub mod rule;
pub mod watch;

pub use rule::{rule_snapshot, RuleAction, RuleSource, TriggerRule, TriggerRuleSpec, UpdatePodTemplate};
pub use watch::{spawn_watchers, watch_rules, watch_sources, WatchConfig};

/// Client from the ambient kubeconfig or in-cluster environment.
pub async fn kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

pub fn api_resource(spec: &KindSpec) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&spec.group, &spec.version, &spec.kind);
    ApiResource::from_gvk_with_plural(&gvk, &spec.plural)
}

/// Map a kube error to the engine's API failure classes.
pub fn cluster_error(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ref resp) if resp.code == 404 => ClusterError::NotFound(resp.message.clone()),
        kube::Error::Api(ref resp) if resp.code == 409 => ClusterError::Conflict(resp.message.clone()),
        other => ClusterError::Api(other.to_string()),
    }
}

/// [`ClusterClient`] over the dynamic kube API; kinds are addressed through their [`KindSpec`].
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, spec: &KindSpec, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(spec))
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, spec: &KindSpec, namespace: &str, name: &str) -> Result<ClusterObject, ClusterError> {
        let obj = self.api(spec, namespace).get(name).await.map_err(cluster_error)?;
        let resource_version = obj.metadata.resource_version.clone().unwrap_or_default();
        let raw = serde_json::to_value(&obj).map_err(|e| ClusterError::Api(format!("serializing {}: {}", name, e)))?;
        Ok(ClusterObject { resource_version, raw })
    }

    async fn patch(&self, spec: &KindSpec, namespace: &str, name: &str, patch: &[u8]) -> Result<(), ClusterError> {
        let doc: json_patch::Patch =
            serde_json::from_slice(patch).map_err(|e| ClusterError::Api(format!("invalid json patch: {}", e)))?;
        self.api(spec, namespace)
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(doc))
            .await
            .map_err(cluster_error)?;
        metrics::counter!("trigger_kube_patches", 1u64);
        Ok(())
    }
}
