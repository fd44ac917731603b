use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::Api;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trigger_apply::Trigger;
use trigger_core::{decode_record, record_key, ClusterClient, KindRegistry, ObjectRef, Record, RuleIdentity, RECORD_KEY_PREFIX};
use trigger_kubehub::{kube_client, rule_snapshot, spawn_watchers, KubeClient, TriggerRule, WatchConfig};
use trigger_store::TriggerEngine;

#[derive(Parser, Debug)]
#[command(name = "kube-trigger", version, about = "Roll workloads when their ConfigMaps and Secrets change")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Annotation key prefix for change records
    #[arg(long = "annotation-prefix", env = "TRIGGER_ANNOTATION_PREFIX", global = true, default_value = RECORD_KEY_PREFIX)]
    annotation_prefix: String,

    /// Log filter directives (tracing EnvFilter syntax)
    #[arg(long = "log", env = "TRIGGER_LOG", global = true, default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "TRIGGER_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch TriggerRules and their sources, rolling workloads on change
    Run {
        /// Only watch rules in this namespace (default: all)
        #[arg(long = "ns", env = "TRIGGER_NAMESPACE")]
        namespace: Option<String>,
        /// Timeout for the rule list issued on every source event
        #[arg(long = "rule-list-timeout-ms", env = "TRIGGER_RULE_LIST_TIMEOUT_MS", default_value_t = 300)]
        rule_list_timeout_ms: u64,
    },
    /// Print the annotation key used for a rule's record
    RecordKey {
        namespace: String,
        name: String,
    },
    /// Show the change records stored on a workload's pod template
    Inspect {
        /// Deployment, StatefulSet or DaemonSet
        kind: String,
        namespace: String,
        name: String,
    },
    /// Compute the patch a rule would apply to a workload, without applying it
    Patch {
        kind: String,
        namespace: String,
        name: String,
        /// Namespace of the TriggerRule
        #[arg(long = "rule-ns")]
        rule_namespace: String,
        /// Name of the TriggerRule
        #[arg(long = "rule-name")]
        rule_name: String,
    },
}

fn init_tracing(directives: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(directives).with_context(|| format!("invalid log filter {:?}", directives))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("installing tracing subscriber: {}", e))
}

fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("serving metrics on {}", addr))?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}

#[derive(Debug, Serialize)]
struct StoredRecord {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Every annotation under `prefix`, decoded.
fn trigger_records(annotations: &BTreeMap<String, String>, prefix: &str) -> Vec<StoredRecord> {
    annotations
        .keys()
        .filter(|k| k.starts_with(prefix))
        .map(|k| match decode_record(Some(annotations), k) {
            Ok(record) => StoredRecord { key: k.clone(), record, error: None },
            Err(e) => StoredRecord { key: k.clone(), record: None, error: Some(e.to_string()) },
        })
        .collect()
}

fn render_time(nanos: i64) -> String {
    chrono::DateTime::from_timestamp(nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000) as u32)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| nanos.to_string())
}

async fn run(prefix: String, namespace: Option<String>, rule_list_timeout_ms: u64) -> Result<()> {
    let client = kube_client().await?;
    let registry = Arc::new(KindRegistry::builtin());
    let trigger = Trigger::new(Arc::new(KubeClient::new(client.clone())), Arc::clone(&registry)).with_key_prefix(prefix);

    let cancel = CancellationToken::new();
    let engine = TriggerEngine::start(Arc::new(trigger), cancel.clone());
    let cfg = WatchConfig { namespace, rule_list_timeout: Duration::from_millis(rule_list_timeout_ms) };
    let mut watchers = spawn_watchers(client, &registry, cfg, engine.sink());
    info!(watchers = watchers.len(), "kube-trigger running");

    let outcome = tokio::select! {
        res = signal::ctrl_c() => res.context("waiting for ctrl-c"),
        (res, idx, _) = futures::future::select_all(watchers.iter_mut()) => {
            error!(watcher = idx, result = ?res, "watcher stopped; exiting");
            Err(anyhow!("watcher {} stopped", idx))
        }
    };
    info!(pending = engine.pending(), "shutting down");
    for w in watchers.iter() {
        w.abort();
    }
    engine.stop().await?;
    outcome
}

async fn inspect(output: Output, prefix: &str, kind: &str, namespace: &str, name: &str) -> Result<()> {
    let registry = KindRegistry::builtin();
    let spec = registry.workload(kind)?;
    let ptr = spec.template_annotations().ok_or_else(|| anyhow!("{} has no pod template", kind))?;
    let client = KubeClient::new(kube_client().await?);
    let obj = client.get(spec, namespace, name).await.with_context(|| format!("getting {} {}/{}", kind, namespace, name))?;
    let records = trigger_records(&obj.string_map_at(ptr).unwrap_or_default(), prefix);

    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        Output::Human => {
            if records.is_empty() {
                println!("no trigger records on {} {}/{}", kind, namespace, name);
            }
            for r in records {
                println!("{}", r.key);
                match (r.record, r.error) {
                    (Some(rec), _) => {
                        println!("  last update: {}", render_time(rec.last_update_time));
                        for s in rec.sources {
                            println!("  {:<10} {}/{}  rv={}", s.kind, s.namespace, s.name, s.resource_version);
                        }
                    }
                    (None, Some(e)) => println!("  unreadable: {}", e),
                    (None, None) => {}
                }
            }
        }
    }
    Ok(())
}

async fn plan(prefix: String, target: ObjectRef, rule: RuleIdentity) -> Result<()> {
    let client = kube_client().await?;
    let rules: Api<TriggerRule> = Api::namespaced(client.clone(), &rule.namespace);
    let obj = rules.get(&rule.name).await.with_context(|| format!("getting TriggerRule {}", rule))?;
    let (_, mut snapshot) = rule_snapshot(&obj)?;

    let trigger = Trigger::new(Arc::new(KubeClient::new(client)), Arc::new(KindRegistry::builtin())).with_key_prefix(prefix);
    trigger.resolve(&mut snapshot).await?;
    match trigger.plan_pod_template(&snapshot, &target).await? {
        Some(patch) => {
            let doc: serde_json::Value = serde_json::from_slice(&patch)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        None => println!("{} is up to date for rule {}", target, rule),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;
    init_metrics(cli.metrics_addr)?;

    match cli.command {
        Commands::Run { namespace, rule_list_timeout_ms } => run(cli.annotation_prefix, namespace, rule_list_timeout_ms).await?,
        Commands::RecordKey { namespace, name } => {
            println!("{}", record_key(&cli.annotation_prefix, &RuleIdentity::new(namespace, name)));
        }
        Commands::Inspect { kind, namespace, name } => inspect(cli.output, &cli.annotation_prefix, &kind, &namespace, &name).await?,
        Commands::Patch { kind, namespace, name, rule_namespace, rule_name } => {
            plan(cli.annotation_prefix, ObjectRef::new(kind, namespace, name), RuleIdentity::new(rule_namespace, rule_name)).await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_filtered_by_prefix_and_decoded() {
        let mut ann = BTreeMap::new();
        ann.insert("trigger.app.example.com/ns.a".to_string(), r#"{"lastUpdateTime":5,"sources":[{"name":"cm","resourceVersion":"3"}]}"#.to_string());
        ann.insert("trigger.app.example.com/ns.b".to_string(), "oops".to_string());
        ann.insert("kubectl.kubernetes.io/restartedAt".to_string(), "2024-01-01T00:00:00Z".to_string());

        let got = trigger_records(&ann, RECORD_KEY_PREFIX);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].key, "trigger.app.example.com/ns.a");
        assert_eq!(got[0].record.as_ref().unwrap().sources[0].resource_version, "3");
        assert!(got[1].record.is_none());
        assert!(got[1].error.is_some());
    }

    #[test]
    fn render_time_is_rfc3339() {
        assert_eq!(render_time(1560210953900081130), "2019-06-10T23:55:53.900081130+00:00");
    }

    #[test]
    fn cli_parses_patch_command() {
        let cli = Cli::try_parse_from([
            "kube-trigger", "patch", "Deployment", "apps", "web", "--rule-ns", "foo-ns", "--rule-name", "foo",
        ])
        .unwrap();
        assert_eq!(cli.annotation_prefix, RECORD_KEY_PREFIX);
        match cli.command {
            Commands::Patch { kind, rule_name, .. } => {
                assert_eq!(kind, "Deployment");
                assert_eq!(rule_name, "foo");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn metrics_addr_must_be_a_socket_address() {
        let ok = Cli::try_parse_from(["kube-trigger", "--metrics-addr", "127.0.0.1:9464", "record-key", "ns", "r"]).unwrap();
        assert_eq!(ok.metrics_addr, Some("127.0.0.1:9464".parse().unwrap()));
        assert!(Cli::try_parse_from(["kube-trigger", "--metrics-addr", "localhost", "record-key", "ns", "r"]).is_err());
    }
}
