#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use trigger_core::{PassOutcome, RuleIdentity, RuleProcessor, RuleSnapshot, TriggerError};
use trigger_store::{spawn_scheduler, DedupQueue, TriggerEngine};

fn snap(name: &str, rv: &str) -> RuleSnapshot {
    RuleSnapshot { identity: RuleIdentity::new("ns", name), resource_version: rv.into(), sources: vec![], actions: vec![] }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, String)>>,
    done: Notify,
    fail: bool,
}

#[async_trait::async_trait]
impl RuleProcessor for Recorder {
    async fn process(&self, snapshot: RuleSnapshot) -> Result<PassOutcome, TriggerError> {
        self.seen.lock().unwrap().push((snapshot.identity.name.clone(), snapshot.resource_version.clone()));
        self.done.notify_one();
        if self.fail {
            return Err(TriggerError::UnsupportedKind { role: "source", kind: "Pod".into() });
        }
        Ok(PassOutcome::default())
    }
}

async fn wait_for(rec: &Recorder, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while rec.seen.lock().unwrap().len() < n {
            rec.done.notified().await;
        }
    })
    .await
    .expect("processor not called in time");
}

#[tokio::test]
async fn only_latest_snapshot_is_processed() {
    let queue = Arc::new(DedupQueue::new());
    let id = RuleIdentity::new("ns", "a");
    queue.push(id.clone(), snap("a", "1"));
    queue.push(id.clone(), snap("a", "3"));
    queue.push(id, snap("a", "2"));

    let rec = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();
    let worker = spawn_scheduler(Arc::clone(&queue), rec.clone(), cancel.clone());
    wait_for(&rec, 1).await;
    cancel.cancel();
    worker.await.unwrap();

    assert_eq!(rec.seen.lock().unwrap().as_slice(), &[("a".to_string(), "3".to_string())]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn add_wakes_an_idle_worker() {
    let rec = Arc::new(Recorder::default());
    let engine = TriggerEngine::start(rec.clone(), CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sink = engine.sink();
    sink.add(RuleIdentity::new("ns", "a"), snap("a", "1"));
    wait_for(&rec, 1).await;
    engine.add(RuleIdentity::new("ns", "b"), snap("b", "1"));
    wait_for(&rec, 2).await;

    engine.stop().await.unwrap();
    let mut names: Vec<_> = rec.seen.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn failed_pass_does_not_stop_the_loop() {
    let rec = Arc::new(Recorder { fail: true, ..Default::default() });
    let engine = TriggerEngine::start(rec.clone(), CancellationToken::new());
    engine.add(RuleIdentity::new("ns", "a"), snap("a", "1"));
    wait_for(&rec, 1).await;
    engine.add(RuleIdentity::new("ns", "a"), snap("a", "2"));
    wait_for(&rec, 2).await;
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn cancelled_worker_leaves_queue_unprocessed() {
    let queue = Arc::new(DedupQueue::new());
    let rec = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    queue.push(RuleIdentity::new("ns", "a"), snap("a", "1"));

    let worker = spawn_scheduler(Arc::clone(&queue), rec.clone(), cancel);
    worker.await.unwrap();

    assert!(rec.seen.lock().unwrap().is_empty());
    assert_eq!(queue.len(), 1);
}

/// Holds every pass open until the gate is released.
#[derive(Default)]
struct Gated {
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    entered: Notify,
    gate: Notify,
}

#[async_trait::async_trait]
impl RuleProcessor for Gated {
    async fn process(&self, snapshot: RuleSnapshot) -> Result<PassOutcome, TriggerError> {
        self.started.lock().unwrap().push(snapshot.identity.name.clone());
        self.entered.notify_one();
        self.gate.notified().await;
        self.finished.lock().unwrap().push(snapshot.identity.name.clone());
        Ok(PassOutcome::default())
    }
}

#[tokio::test]
async fn cancel_lets_running_pass_finish_and_pops_nothing_more() {
    let queue = Arc::new(DedupQueue::new());
    queue.push(RuleIdentity::new("ns", "a"), snap("a", "1"));
    queue.push(RuleIdentity::new("ns", "b"), snap("b", "1"));

    let proc = Arc::new(Gated::default());
    let cancel = CancellationToken::new();
    let worker = spawn_scheduler(Arc::clone(&queue), proc.clone(), cancel.clone());

    tokio::time::timeout(Duration::from_secs(5), proc.entered.notified()).await.expect("pass not started");
    cancel.cancel();
    proc.gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), worker).await.expect("worker did not stop").unwrap();

    assert_eq!(proc.started.lock().unwrap().as_slice(), &["a".to_string()]);
    assert_eq!(proc.finished.lock().unwrap().as_slice(), &["a".to_string()]);
    assert_eq!(queue.len(), 1);
    assert!(queue.get(&RuleIdentity::new("ns", "b")).is_some());
}
