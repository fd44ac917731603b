//! kube-trigger store: coalescing pending queue and the single-worker scheduler loop.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use trigger_core::{RuleIdentity, RuleProcessor, RuleSink, RuleSnapshot};

/// Pending rules keyed by identity, drained in first-queued order.
#[derive(Default)]
struct Pending {
    map: FxHashMap<RuleIdentity, RuleSnapshot>,
    order: VecDeque<RuleIdentity>,
}

/// Pending rules keyed by identity; only the newest snapshot per identity is kept.
///
/// A replaced snapshot keeps its identity's place in line, so a rule re-added
/// while its own pass runs cannot overtake rules that were already waiting.
#[derive(Default)]
pub struct DedupQueue {
    pending: Mutex<Pending>,
    wake: Notify,
}

impl DedupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // Map and order are only touched together under this lock.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert, or replace the queued snapshot unless `snapshot` is older than it.
    /// Returns whether the queue now holds `snapshot`.
    pub fn push(&self, identity: RuleIdentity, snapshot: RuleSnapshot) -> bool {
        let accepted = {
            let mut guard = self.lock();
            let pending = &mut *guard;
            match pending.map.get_mut(&identity) {
                Some(stored) if snapshot.is_older_than(stored) => false,
                Some(stored) => {
                    *stored = snapshot;
                    counter!("trigger_events_coalesced", 1u64);
                    true
                }
                None => {
                    pending.order.push_back(identity.clone());
                    pending.map.insert(identity, snapshot);
                    counter!("trigger_events_added", 1u64);
                    true
                }
            }
        };
        if accepted {
            self.wake.notify_one();
        } else {
            counter!("trigger_events_stale", 1u64);
        }
        accepted
    }

    /// Remove and return the longest-waiting entry.
    pub fn pop(&self) -> Option<(RuleIdentity, RuleSnapshot)> {
        let mut pending = self.lock();
        while let Some(identity) = pending.order.pop_front() {
            if let Some(snapshot) = pending.map.remove(&identity) {
                return Some((identity, snapshot));
            }
        }
        None
    }

    /// Peek at the snapshot queued for `identity`.
    pub fn get(&self, identity: &RuleIdentity) -> Option<RuleSnapshot> {
        self.lock().map.get(identity).cloned()
    }

    /// Resolves once something was pushed since the last wake-up was consumed.
    pub async fn notified(&self) {
        self.wake.notified().await
    }
}

impl RuleSink for DedupQueue {
    fn add(&self, identity: RuleIdentity, snapshot: RuleSnapshot) {
        if !self.push(identity.clone(), snapshot) {
            debug!(rule = %identity, "stale rule snapshot ignored");
        }
    }
}

/// Spawn the single worker draining `queue` one rule at a time.
///
/// Cancellation is observed only between passes; a running pass always
/// completes. Entries still queued when the loop exits are dropped.
pub fn spawn_scheduler(
    queue: Arc<DedupQueue>,
    processor: Arc<dyn RuleProcessor>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("scheduler started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match queue.pop() {
                Some((identity, snapshot)) => run_pass(processor.as_ref(), identity, snapshot).await,
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = queue.notified() => {}
                },
            }
        }
        info!(discarded = queue.len(), "scheduler stopped");
    })
}

async fn run_pass(processor: &dyn RuleProcessor, identity: RuleIdentity, snapshot: RuleSnapshot) {
    let t0 = Instant::now();
    info!(rule = %identity, "processing rule");
    match processor.process(snapshot).await {
        Ok(outcome) => {
            counter!("trigger_pass_ok", 1u64);
            info!(rule = %identity, patched = outcome.patched, skipped = outcome.skipped, "rule processed");
        }
        Err(e) => {
            counter!("trigger_pass_err", 1u64);
            error!(rule = %identity, kind = e.label(), error = %e, "rule pass failed");
        }
    }
    histogram!("trigger_pass_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
}

/// The engine value owned by the composition root: queue plus its worker.
pub struct TriggerEngine {
    queue: Arc<DedupQueue>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl TriggerEngine {
    /// Start the worker. Cancelling `cancel` (or calling [`TriggerEngine::stop`]) ends it.
    pub fn start(processor: Arc<dyn RuleProcessor>, cancel: CancellationToken) -> Self {
        let queue = Arc::new(DedupQueue::new());
        let worker = spawn_scheduler(Arc::clone(&queue), processor, cancel.clone());
        Self { queue, cancel, worker }
    }

    /// Handle for watch sources.
    pub fn sink(&self) -> Arc<dyn RuleSink> {
        Arc::clone(&self.queue) as Arc<dyn RuleSink>
    }

    pub fn add(&self, identity: RuleIdentity, snapshot: RuleSnapshot) {
        self.queue.add(identity, snapshot);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Signal shutdown and wait for the in-flight pass, if any, to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.worker.await.context("joining scheduler task")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(name: &str, rv: &str) -> RuleSnapshot {
        RuleSnapshot { identity: RuleIdentity::new("ns", name), resource_version: rv.into(), sources: vec![], actions: vec![] }
    }

    #[test]
    fn newer_snapshot_replaces_older() {
        let q = DedupQueue::new();
        let id = RuleIdentity::new("ns", "a");
        assert!(q.push(id.clone(), snap("a", "1")));
        assert!(q.push(id.clone(), snap("a", "2")));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(&id).unwrap().resource_version, "2");
    }

    #[test]
    fn older_snapshot_is_ignored() {
        let q = DedupQueue::new();
        let id = RuleIdentity::new("ns", "a");
        q.add(id.clone(), snap("a", "2"));
        q.add(id.clone(), snap("a", "1"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(&id).unwrap().resource_version, "2");
    }

    #[test]
    fn equal_version_replaces() {
        let q = DedupQueue::new();
        let id = RuleIdentity::new("ns", "a");
        let mut second = snap("a", "2");
        second.sources.push(trigger_core::SourceRef::new("ConfigMap", "ns", "cm"));
        q.add(id.clone(), snap("a", "2"));
        q.add(id.clone(), second);
        assert_eq!(q.get(&id).unwrap().sources.len(), 1);
    }

    #[test]
    fn pop_drains_every_identity_once() {
        let q = DedupQueue::new();
        for n in ["a", "b", "c"] {
            q.add(RuleIdentity::new("ns", n), snap(n, "1"));
        }
        let mut seen = Vec::new();
        while let Some((id, s)) = q.pop() {
            assert_eq!(id, s.identity);
            seen.push(id.name);
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(q.is_empty());
        assert!(q.pop().is_none());
    }

    #[test]
    fn pop_is_first_queued_first_out() {
        let q = DedupQueue::new();
        for n in ["a", "b", "c"] {
            q.add(RuleIdentity::new("ns", n), snap(n, "1"));
        }
        q.add(RuleIdentity::new("ns", "a"), snap("a", "2"));
        let order: Vec<_> = std::iter::from_fn(|| q.pop()).map(|(id, s)| (id.name, s.resource_version)).collect();
        assert_eq!(
            order,
            vec![("a".to_string(), "2".to_string()), ("b".to_string(), "1".to_string()), ("c".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn requeued_rule_does_not_starve_others() {
        let q = DedupQueue::new();
        for n in ["a", "b", "c", "d"] {
            q.add(RuleIdentity::new("ns", n), snap(n, "000"));
        }
        let mut popped = Vec::new();
        for round in 1..=50 {
            let (id, _) = q.pop().unwrap();
            popped.push(id.name.clone());
            // The rule changes again while its pass runs.
            let name = id.name.clone();
            q.add(id, snap(&name, &format!("{:03}", round)));
        }
        popped.sort();
        popped.dedup();
        assert_eq!(popped, vec!["a", "b", "c", "d"]);
        assert_eq!(q.len(), 4);
    }
}
