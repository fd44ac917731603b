//! Error taxonomy for a processing pass.

use thiserror::Error;

/// Failure reported by a [`crate::ClusterClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api: {0}")]
    Api(String),
}

#[derive(Debug, Error)]
pub enum TriggerError {
    /// Kind tag not registered, or registered with the wrong role.
    #[error("unsupported {role} kind {kind:?}")]
    UnsupportedKind { role: &'static str, kind: String },

    #[error("resolve source {target}: {source}")]
    Resolution { target: String, source: ClusterError },

    /// Malformed record annotation. Never fatal: callers treat it as "no record".
    #[error("decode record annotation {key:?}: {source}")]
    RecordDecode { key: String, source: serde_json::Error },

    #[error("encode patch: {0}")]
    PatchGeneration(#[source] serde_json::Error),

    #[error("get target {target}: {source}")]
    TargetFetch { target: String, source: ClusterError },

    #[error("patch target {target}: {source}")]
    Apply { target: String, source: ClusterError },

    #[error("rule {rule} has an action with nothing to execute")]
    EmptyAction { rule: String },
}

impl TriggerError {
    /// Short label for log fields and metric keys.
    pub fn label(&self) -> &'static str {
        match self {
            TriggerError::UnsupportedKind { .. } => "unsupported_kind",
            TriggerError::Resolution { .. } => "resolution",
            TriggerError::RecordDecode { .. } => "record_decode",
            TriggerError::PatchGeneration(_) => "patch_generation",
            TriggerError::TargetFetch { .. } => "target_fetch",
            TriggerError::Apply { .. } => "apply",
            TriggerError::EmptyAction { .. } => "empty_action",
        }
    }
}
