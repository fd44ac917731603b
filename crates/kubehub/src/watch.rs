//! Watch wiring: turn rule and source changes into engine `add` calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trigger_core::{KindRegistry, KindSpec, RuleSink};

use crate::{api_resource, rule_snapshot, TriggerRule};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Restrict rules to one namespace; sources are always watched cluster-wide.
    pub namespace: Option<String>,
    /// Bound on the rule list issued for every source event.
    pub rule_list_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { namespace: None, rule_list_timeout: Duration::from_millis(300) }
    }
}

fn rules_api(client: Client, namespace: Option<&str>) -> Api<TriggerRule> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn enqueue(sink: &dyn RuleSink, rule: &TriggerRule) {
    match rule_snapshot(rule) {
        Ok((identity, snapshot)) => sink.add(identity, snapshot),
        Err(e) => warn!(rule = %rule.name_any(), error = %e, "skipping malformed rule"),
    }
}

async fn list_rules(client: Client, cfg: &WatchConfig) -> Result<Vec<TriggerRule>> {
    let api = rules_api(client, cfg.namespace.as_deref());
    let list = tokio::time::timeout(cfg.rule_list_timeout, api.list(&ListParams::default()))
        .await
        .map_err(|_| anyhow!("listing rules timed out after {:?}", cfg.rule_list_timeout))?
        .context("listing rules")?;
    Ok(list.items)
}

/// Add every rule with a source pointing at `kind namespace/name`; returns how many.
async fn enqueue_referencing(client: Client, cfg: &WatchConfig, sink: &dyn RuleSink, kind: &str, namespace: &str, name: &str) -> Result<usize> {
    let mut n = 0;
    for rule in list_rules(client, cfg).await? {
        match rule_snapshot(&rule) {
            Ok((identity, snapshot)) if snapshot.references_source(kind, namespace, name) => {
                sink.add(identity, snapshot);
                n += 1;
            }
            Ok(_) => {}
            Err(e) => debug!(rule = %rule.name_any(), error = %e, "skipping malformed rule"),
        }
    }
    Ok(n)
}

/// Feed every applied rule, and every rule seen on relist, into `sink`.
///
/// Watch errors are logged and the stream is polled again after a backoff;
/// this only returns if the underlying stream ends.
pub async fn watch_rules(client: Client, cfg: WatchConfig, sink: Arc<dyn RuleSink>) {
    let api = rules_api(client, cfg.namespace.as_deref());
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?cfg.namespace, "rule watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Applied(rule)) => enqueue(sink.as_ref(), &rule),
            Ok(Event::Deleted(rule)) => debug!(rule = %rule.name_any(), "rule deleted"),
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "rule watch restart");
                for rule in list.iter() {
                    enqueue(sink.as_ref(), rule);
                }
            }
            Err(e) => {
                counter!("trigger_watch_errors", 1u64);
                warn!(error = %e, "rule watch error; retrying");
            }
        }
    }
    warn!("rule watcher stream ended");
}

/// Watch one source kind cluster-wide and re-add the rules referencing each changed object.
pub async fn watch_sources(client: Client, spec: KindSpec, cfg: WatchConfig, sink: Arc<dyn RuleSink>) {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &api_resource(&spec));
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %spec.kind, "source watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Applied(obj)) | Ok(Event::Deleted(obj)) => {
                let ns = obj.namespace().unwrap_or_default();
                let name = obj.name_any();
                match enqueue_referencing(client.clone(), &cfg, sink.as_ref(), &spec.kind, &ns, &name).await {
                    Ok(n) => debug!(kind = %spec.kind, ns = %ns, name = %name, rules = n, "source changed"),
                    Err(e) => error!(kind = %spec.kind, ns = %ns, name = %name, error = ?e, "failed to map source to rules"),
                }
            }
            Ok(Event::Restarted(list)) => {
                debug!(kind = %spec.kind, count = list.len(), "source watch restart");
                match list_rules(client.clone(), &cfg).await {
                    Ok(rules) => rules.iter().for_each(|r| enqueue(sink.as_ref(), r)),
                    Err(e) => error!(kind = %spec.kind, error = ?e, "failed to resync rules"),
                }
            }
            Err(e) => {
                counter!("trigger_watch_errors", 1u64);
                warn!(kind = %spec.kind, error = %e, "source watch error; retrying");
            }
        }
    }
    warn!(kind = %spec.kind, "source watcher stream ended");
}

/// Spawn the rule watcher plus one watcher per registered source kind.
///
/// The rule watcher is always first. A handle that completes means its
/// watcher has stopped for good.
pub fn spawn_watchers(client: Client, registry: &KindRegistry, cfg: WatchConfig, sink: Arc<dyn RuleSink>) -> Vec<JoinHandle<()>> {
    let mut handles = vec![tokio::spawn(watch_rules(client.clone(), cfg.clone(), Arc::clone(&sink)))];
    for spec in registry.source_kinds() {
        handles.push(tokio::spawn(watch_sources(client.clone(), spec.clone(), cfg.clone(), Arc::clone(&sink))));
    }
    handles
}
