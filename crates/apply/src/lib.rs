//! kube-trigger apply: resolve rule sources and roll target workloads.
//!
//! A pass for one rule fans out twice. First every source is fetched to learn
//! its current version stamp, then every action is run against its target.
//! Both fan-outs drive all siblings to completion and report the first error
//! observed; a failure never cancels the other in-flight requests.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use tracing::{debug, info};
use trigger_core::{
    generate_patch, next_record, now_nanos, record_key, Action, ClusterClient, KindRegistry, ObjectRef, PassOutcome,
    RuleProcessor, RuleSnapshot, SourceRef, TriggerError, RECORD_KEY_PREFIX,
};

/// Poll every future to completion. Successes are returned in completion
/// order; if any failed, the earliest failure is returned instead.
async fn join_first_error<T, F>(tasks: impl IntoIterator<Item = F>) -> Result<Vec<T>, TriggerError>
where
    F: Future<Output = Result<T, TriggerError>>,
{
    let mut pending: FuturesUnordered<F> = tasks.into_iter().collect();
    let mut out = Vec::with_capacity(pending.len());
    let mut first_err = None;
    while let Some(res) = pending.next().await {
        match res {
            Ok(v) => out.push(v),
            Err(e) if first_err.is_none() => first_err = Some(e),
            Err(e) => debug!(error = %e, "suppressed sibling error"),
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Fill `version_stamp` of every source with the object's current resource version.
///
/// Kinds are checked before any request is made. On error no stamp is written.
pub async fn resolve_sources(
    client: &dyn ClusterClient,
    registry: &KindRegistry,
    sources: &mut [SourceRef],
) -> Result<(), TriggerError> {
    let specs = sources
        .iter()
        .map(|s| registry.source(&s.target.kind))
        .collect::<Result<Vec<_>, _>>()?;

    let stamps = join_first_error(sources.iter().zip(specs).enumerate().map(|(idx, (src, spec))| async move {
        client
            .get(spec, &src.target.namespace, &src.target.name)
            .await
            .map(|obj| (idx, obj.resource_version))
            .map_err(|source| TriggerError::Resolution { target: src.target.to_string(), source })
    }))
    .await?;

    for (idx, stamp) in stamps {
        if let Some(src) = sources.get_mut(idx) {
            src.version_stamp = stamp;
        }
    }
    Ok(())
}

/// Rule processor writing change records into workload pod templates.
pub struct Trigger {
    client: Arc<dyn ClusterClient>,
    registry: Arc<KindRegistry>,
    key_prefix: String,
    clock: fn() -> i64,
}

impl Trigger {
    pub fn new(client: Arc<dyn ClusterClient>, registry: Arc<KindRegistry>) -> Self {
        Self { client, registry, key_prefix: RECORD_KEY_PREFIX.to_string(), clock: now_nanos }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Override the nanosecond clock stamped on fresh records.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub async fn resolve(&self, rule: &mut RuleSnapshot) -> Result<(), TriggerError> {
        resolve_sources(self.client.as_ref(), &self.registry, &mut rule.sources).await
    }

    /// Decide for one workload and return the patch that would roll it, if any.
    /// `rule` must already carry resolved stamps.
    pub async fn plan_pod_template(&self, rule: &RuleSnapshot, target: &ObjectRef) -> Result<Option<Vec<u8>>, TriggerError> {
        let spec = self.registry.workload(&target.kind)?;
        let ptr = spec
            .template_annotations()
            .ok_or_else(|| TriggerError::UnsupportedKind { role: "workload", kind: target.kind.clone() })?;
        let obj = self
            .client
            .get(spec, &target.namespace, &target.name)
            .await
            .map_err(|source| TriggerError::TargetFetch { target: target.to_string(), source })?;

        let annotations = obj.string_map_at(ptr);
        let key = record_key(&self.key_prefix, &rule.identity);
        match next_record(rule, annotations.as_ref(), &key, (self.clock)()) {
            Some(rec) => generate_patch(&rec, &key, ptr, annotations.is_some()).map(Some),
            None => Ok(None),
        }
    }

    /// Returns whether a patch was applied.
    async fn update_pod_template(&self, rule: &RuleSnapshot, target: &ObjectRef) -> Result<bool, TriggerError> {
        let Some(patch) = self.plan_pod_template(rule, target).await? else {
            debug!(rule = %rule.identity, target = %target, "sources unchanged; nothing to roll");
            counter!("trigger_patch_skipped", 1u64);
            return Ok(false);
        };
        info!(rule = %rule.identity, target = %target, patch = %String::from_utf8_lossy(&patch), "patching pod template");
        let spec = self.registry.workload(&target.kind)?;
        self.client
            .patch(spec, &target.namespace, &target.name, &patch)
            .await
            .map_err(|source| TriggerError::Apply { target: target.to_string(), source })?;
        counter!("trigger_patch_applied", 1u64);
        Ok(true)
    }

    async fn run_action(&self, rule: &RuleSnapshot, action: &Action) -> Result<bool, TriggerError> {
        match action {
            Action::UpdatePodTemplate { target } => self.update_pod_template(rule, target).await,
        }
    }

    /// Run every action of `rule` concurrently.
    pub async fn execute_actions(&self, rule: &RuleSnapshot) -> Result<PassOutcome, TriggerError> {
        let results = join_first_error(rule.actions.iter().map(|a| self.run_action(rule, a))).await?;
        let patched = results.iter().filter(|p| **p).count();
        Ok(PassOutcome { patched, skipped: results.len() - patched })
    }
}

#[async_trait::async_trait]
impl RuleProcessor for Trigger {
    async fn process(&self, mut snapshot: RuleSnapshot) -> Result<PassOutcome, TriggerError> {
        self.resolve(&mut snapshot).await?;
        self.execute_actions(&snapshot).await
    }
}
