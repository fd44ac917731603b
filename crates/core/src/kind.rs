//! Kind registry: maps a kind tag to how the engine reaches and patches it.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::TriggerError;

/// Pointer to the pod template annotations of the built-in workload kinds.
pub const POD_TEMPLATE_ANNOTATIONS: &str = "/spec/template/metadata/annotations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindRole {
    /// Watched object whose version stamp feeds change detection.
    Source,
    /// Rollable workload; `template_annotations` is the JSON pointer of its
    /// pod template annotation map.
    Workload { template_annotations: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSpec {
    pub kind: String,
    pub group: String,
    pub version: String,
    pub plural: String,
    pub role: KindRole,
}

impl KindSpec {
    pub fn source(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            kind: kind.to_string(),
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            role: KindRole::Source,
        }
    }

    pub fn workload(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            kind: kind.to_string(),
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            role: KindRole::Workload { template_annotations: POD_TEMPLATE_ANNOTATIONS.to_string() },
        }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn template_annotations(&self) -> Option<&str> {
        match &self.role {
            KindRole::Workload { template_annotations } => Some(template_annotations.as_str()),
            KindRole::Source => None,
        }
    }
}

/// Registered kinds keyed by tag. Adding a kind is a [`KindRegistry::register`] call.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: FxHashMap<String, KindSpec>,
}

impl KindRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// ConfigMap and Secret as sources; Deployment, StatefulSet and DaemonSet as workloads.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register(KindSpec::source("", "v1", "ConfigMap", "configmaps"));
        r.register(KindSpec::source("", "v1", "Secret", "secrets"));
        r.register(KindSpec::workload("apps", "v1", "Deployment", "deployments"));
        r.register(KindSpec::workload("apps", "v1", "StatefulSet", "statefulsets"));
        r.register(KindSpec::workload("apps", "v1", "DaemonSet", "daemonsets"));
        r
    }

    /// Insert or replace the spec for `spec.kind`.
    pub fn register(&mut self, spec: KindSpec) {
        self.kinds.insert(spec.kind.clone(), spec);
    }

    pub fn get(&self, kind: &str) -> Option<&KindSpec> {
        self.kinds.get(kind)
    }

    pub fn source(&self, kind: &str) -> Result<&KindSpec, TriggerError> {
        match self.kinds.get(kind) {
            Some(spec) if spec.role == KindRole::Source => Ok(spec),
            _ => Err(TriggerError::UnsupportedKind { role: "source", kind: kind.to_string() }),
        }
    }

    pub fn workload(&self, kind: &str) -> Result<&KindSpec, TriggerError> {
        match self.kinds.get(kind) {
            Some(spec) if spec.template_annotations().is_some() => Ok(spec),
            _ => Err(TriggerError::UnsupportedKind { role: "workload", kind: kind.to_string() }),
        }
    }

    /// Source kinds, sorted by tag.
    pub fn source_kinds(&self) -> Vec<&KindSpec> {
        let mut out: Vec<_> = self.kinds.values().filter(|s| s.role == KindRole::Source).collect();
        out.sort_by(|a, b| a.kind.cmp(&b.kind));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_roles() {
        let r = KindRegistry::builtin();
        assert!(r.source("ConfigMap").is_ok());
        assert!(r.source("Secret").is_ok());
        for k in ["Deployment", "StatefulSet", "DaemonSet"] {
            let spec = r.workload(k).unwrap();
            assert_eq!(spec.template_annotations(), Some(POD_TEMPLATE_ANNOTATIONS));
            assert_eq!(spec.group, "apps");
        }
        let kinds: Vec<_> = r.source_kinds().iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "Secret"]);
    }

    #[test]
    fn wrong_role_is_unsupported() {
        let r = KindRegistry::builtin();
        let e = r.source("Deployment").unwrap_err();
        assert!(matches!(e, TriggerError::UnsupportedKind { role: "source", .. }));
        let e = r.workload("ConfigMap").unwrap_err();
        assert!(matches!(e, TriggerError::UnsupportedKind { role: "workload", .. }));
        assert!(r.workload("ReplicaSet").is_err());
    }

    #[test]
    fn register_adds_a_kind() {
        let mut r = KindRegistry::builtin();
        assert!(r.workload("Rollout").is_err());
        r.register(KindSpec::workload("argoproj.io", "v1alpha1", "Rollout", "rollouts"));
        assert_eq!(r.workload("Rollout").unwrap().gvk_key(), "argoproj.io/v1alpha1/Rollout");
        assert_eq!(r.source("ConfigMap").unwrap().gvk_key(), "v1/ConfigMap");
    }
}
