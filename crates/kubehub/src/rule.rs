//! The `TriggerRule` custom resource and its conversion into engine snapshots.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use trigger_core::{Action, ObjectRef, RuleIdentity, RuleSnapshot, SourceRef, TriggerError};

/// Binds source objects (ConfigMaps, Secrets) to rolling-update actions.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(group = "app.example.com", version = "v1alpha1", kind = "TriggerRule", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct TriggerRuleSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<RuleSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<RuleAction>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleSource {
    #[serde(default)]
    pub object_ref: ObjectReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_pod_template: Option<UpdatePodTemplate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePodTemplate {
    #[serde(default)]
    pub object_ref: ObjectReference,
}

fn object_ref(r: &ObjectReference, default_ns: &str) -> ObjectRef {
    let namespace = r.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(default_ns);
    ObjectRef::new(
        r.kind.clone().unwrap_or_default(),
        namespace,
        r.name.clone().unwrap_or_default(),
    )
}

/// Snapshot a rule as it is now. References without a namespace resolve in the rule's namespace.
pub fn rule_snapshot(rule: &TriggerRule) -> Result<(RuleIdentity, RuleSnapshot), TriggerError> {
    let identity = RuleIdentity::new(rule.namespace().unwrap_or_default(), rule.name_any());
    let ns = identity.namespace.as_str();

    let sources = rule
        .spec
        .sources
        .iter()
        .map(|s| {
            let target = object_ref(&s.object_ref, ns);
            SourceRef { target, version_stamp: String::new() }
        })
        .collect();
    let actions = rule
        .spec
        .actions
        .iter()
        .map(|a| match &a.update_pod_template {
            Some(upt) => Ok(Action::UpdatePodTemplate { target: object_ref(&upt.object_ref, ns) }),
            None => Err(TriggerError::EmptyAction { rule: identity.to_string() }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let snapshot = RuleSnapshot {
        identity: identity.clone(),
        resource_version: rule.resource_version().unwrap_or_default(),
        sources,
        actions,
    };
    Ok((identity, snapshot))
}
