//! kube-trigger core: rule snapshots, kind registry, change records and patches.
//!
//! Nothing in this crate performs I/O. The cluster is reached through the
//! [`ClusterClient`] seam, and processing is driven through [`RuleProcessor`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod kind;
pub mod patch;
pub mod record;

pub use error::{ClusterError, TriggerError};
pub use kind::{KindRegistry, KindRole, KindSpec};
pub use patch::{escape_pointer_segment, generate_patch, unescape_pointer_segment};
pub use record::{decode_record, next_record, now_nanos, record_key, Record, SourceSnapshot, RECORD_KEY_PREFIX};

/// Stable key of a rule: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleIdentity {
    pub namespace: String,
    pub name: String,
}

impl RuleIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for RuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to a namespaced object by kind tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A watched source object. `version_stamp` is empty until the resolver fills it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub target: ObjectRef,
    #[serde(default)]
    pub version_stamp: String,
}

impl SourceRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { target: ObjectRef::new(kind, namespace, name), version_stamp: String::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Roll the workload by writing the change record into its pod template annotations.
    UpdatePodTemplate { target: ObjectRef },
}

/// Desired state of a rule as seen at enqueue time. Source order is significant:
/// records correlate to sources by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub identity: RuleIdentity,
    /// The rule object's own resource version; compared as an opaque string.
    pub resource_version: String,
    pub sources: Vec<SourceRef>,
    pub actions: Vec<Action>,
}

impl RuleSnapshot {
    /// True when `self` must not replace `stored` in the pending queue.
    pub fn is_older_than(&self, stored: &RuleSnapshot) -> bool {
        stored.resource_version > self.resource_version
    }

    /// Whether any source of the rule is the given object.
    pub fn references_source(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.sources
            .iter()
            .any(|s| s.target.kind == kind && s.target.namespace == namespace && s.target.name == name)
    }
}

/// Object returned by [`ClusterClient::get`]: the opaque version stamp plus the raw body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterObject {
    pub resource_version: String,
    pub raw: serde_json::Value,
}

impl ClusterObject {
    /// String map found at a JSON pointer inside the object, `None` when absent or null.
    pub fn string_map_at(&self, pointer: &str) -> Option<BTreeMap<String, String>> {
        let obj = self.raw.pointer(pointer)?.as_object()?;
        Some(
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        )
    }
}

/// Minimal cluster API used by the engine.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, spec: &KindSpec, namespace: &str, name: &str) -> Result<ClusterObject, ClusterError>;

    /// Apply a JSON Patch document (RFC 6902) to a workload.
    async fn patch(&self, spec: &KindSpec, namespace: &str, name: &str, patch: &[u8]) -> Result<(), ClusterError>;
}

/// Receiver of "rule changed" events. Fire-and-forget.
pub trait RuleSink: Send + Sync {
    fn add(&self, identity: RuleIdentity, snapshot: RuleSnapshot);
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassOutcome {
    pub patched: usize,
    pub skipped: usize,
}

/// One full pass for a popped rule: resolve sources, decide, patch targets.
#[async_trait::async_trait]
pub trait RuleProcessor: Send + Sync {
    async fn process(&self, snapshot: RuleSnapshot) -> Result<PassOutcome, TriggerError>;
}

pub mod prelude {
    pub use super::{
        Action, ClusterClient, ClusterError, ClusterObject, KindRegistry, KindRole, KindSpec, ObjectRef,
        PassOutcome, Record, RuleIdentity, RuleProcessor, RuleSink, RuleSnapshot, SourceRef, SourceSnapshot,
        TriggerError,
    };
}
