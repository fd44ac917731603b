//! Change records persisted on workload pod templates, and the change detector.
//!
//! A [`Record`] is stored as JSON in one annotation per rule. On every pass the
//! detector reads it back, compares it with the freshly resolved source stamps
//! and decides whether the workload has to roll.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{RuleIdentity, RuleSnapshot, TriggerError};

pub const RECORD_KEY_PREFIX: &str = "trigger.app.example.com/";

/// Annotation key holding the record of `rule`: `<prefix><namespace>.<name>`.
pub fn record_key(prefix: &str, rule: &RuleIdentity) -> String {
    format!("{}{}.{}", prefix, rule.namespace, rule.name)
}

/// Wall clock in Unix nanoseconds, as stamped on fresh records.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unix time in nanoseconds of the last full reset.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub last_update_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

impl Record {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Fresh record carrying every current stamp of `rule`.
    pub fn from_rule(rule: &RuleSnapshot, now_nanos: i64) -> Self {
        let sources = rule
            .sources
            .iter()
            .map(|s| SourceSnapshot {
                name: s.target.name.clone(),
                namespace: s.target.namespace.clone(),
                kind: s.target.kind.clone(),
                resource_version: s.version_stamp.clone(),
            })
            .collect();
        Record { last_update_time: now_nanos, sources }
    }

    /// Same length and, index by index, the same (name, namespace, kind).
    pub fn matches_sources(&self, rule: &RuleSnapshot) -> bool {
        self.sources.len() == rule.sources.len()
            && self.sources.iter().zip(rule.sources.iter()).all(|(rec, cur)| {
                rec.name == cur.target.name && rec.namespace == cur.target.namespace && rec.kind == cur.target.kind
            })
    }
}

/// Read the record stored under `key`. Absent map or key is `Ok(None)`.
pub fn decode_record(annotations: Option<&BTreeMap<String, String>>, key: &str) -> Result<Option<Record>, TriggerError> {
    let Some(raw) = annotations.and_then(|m| m.get(key)) else {
        return Ok(None);
    };
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|source| TriggerError::RecordDecode { key: key.to_string(), source })
}

/// Decide whether `rule` needs a rolling update of the workload carrying `annotations`.
///
/// Returns `None` when every recorded stamp is current. Otherwise returns the
/// record to persist: a fresh one (stamped with `now_nanos`) when there is no
/// usable prior record, or the prior record with advanced stamps bumped.
pub fn next_record(
    rule: &RuleSnapshot,
    annotations: Option<&BTreeMap<String, String>>,
    key: &str,
    now_nanos: i64,
) -> Option<Record> {
    let prior = match decode_record(annotations, key) {
        Ok(v) => v,
        Err(e) => {
            warn!(rule = %rule.identity, error = %e, "record annotation unreadable; treating as absent");
            None
        }
    };

    let mut rec = match prior {
        Some(rec) if rec.matches_sources(rule) => rec,
        Some(rec) => {
            warn!(rule = %rule.identity, recorded = rec.sources.len(), current = rule.sources.len(), "record does not match rule sources; resetting");
            return Some(Record::from_rule(rule, now_nanos));
        }
        None => return Some(Record::from_rule(rule, now_nanos)),
    };

    let mut dirty = false;
    for (recorded, current) in rec.sources.iter_mut().zip(rule.sources.iter()) {
        if current.version_stamp > recorded.resource_version {
            debug!(rule = %rule.identity, source = %current.target, from = %recorded.resource_version, to = %current.version_stamp, "source advanced");
            recorded.resource_version = current.version_stamp.clone();
            dirty = true;
        }
    }
    dirty.then_some(rec)
}
