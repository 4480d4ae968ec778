//! End-to-end tests for access sessions
//!
//! These tests drive node resolution and the session lifecycle against an
//! in-memory cluster and verify that no session pod outlives an invocation.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;

use kubectl_ssh::error::{Result, SshError};
use kubectl_ssh::k8s::{
    resolve_node, session_labels, AttachedSession, ClusterApi, NameGenerator, PodEvent,
    PodEventStream, SessionPhase, NODE_ANNOTATION, NODE_LABEL,
};
use kubectl_ssh::session::{SessionManager, SessionSettings, TerminalStreams};

#[derive(Clone, Copy)]
enum AttachBehavior {
    Shell,
    Refused,
    ExitCode(i32),
    /// Shell that stays attached without producing output
    Idle,
}

struct FakeCluster {
    nodes: Vec<(String, BTreeMap<String, String>)>,
    phases: Vec<SessionPhase>,
    watch_hangs: bool,
    attach_behavior: AttachBehavior,
    reject_create: bool,
    /// Time the create response takes after the pod was stored
    create_delay: Option<Duration>,
    pods: Mutex<BTreeMap<String, Pod>>,
    created: Mutex<Vec<Pod>>,
    deleted: Mutex<Vec<String>>,
    node_lists: Mutex<u32>,
}

impl FakeCluster {
    fn with_nodes(names: &[&str]) -> Self {
        Self {
            nodes: names
                .iter()
                .map(|n| (n.to_string(), BTreeMap::new()))
                .collect(),
            phases: vec![SessionPhase::Pending, SessionPhase::Running],
            watch_hangs: false,
            attach_behavior: AttachBehavior::Shell,
            reject_create: false,
            create_delay: None,
            pods: Mutex::new(BTreeMap::new()),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            node_lists: Mutex::new(0),
        }
    }

    fn label_node(mut self, node: &str, key: &str, value: &str) -> Self {
        if let Some((_, labels)) = self.nodes.iter_mut().find(|(n, _)| n == node) {
            labels.insert(key.to_string(), value.to_string());
        }
        self
    }

    fn phases(mut self, phases: &[SessionPhase], watch_hangs: bool) -> Self {
        self.phases = phases.to_vec();
        self.watch_hangs = watch_hangs;
        self
    }

    fn attach_behavior(mut self, behavior: AttachBehavior) -> Self {
        self.attach_behavior = behavior;
        self
    }

    /// Session pods still present that are bound to `node`
    fn session_pods_on(&self, node: &str) -> Vec<String> {
        let wanted = session_labels(node);
        self.pods
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, pod)| pod.metadata.labels.as_ref() == Some(&wanted))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn created(&self) -> Vec<Pod> {
        self.created.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<String>> {
        *self.node_lists.lock().unwrap() += 1;
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.split_once('='))
            .collect();

        Ok(self
            .nodes
            .iter()
            .filter(|(_, labels)| {
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        if self.reject_create {
            return Err(SshError::SessionCreate {
                name,
                message: "exceeded quota: pods=10".into(),
            });
        }
        self.pods.lock().unwrap().insert(name, pod.clone());
        self.created.lock().unwrap().push(pod.clone());
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(pod.clone())
    }

    async fn watch_pod(&self, _name: &str) -> Result<PodEventStream> {
        let events: Vec<Result<PodEvent>> = self
            .phases
            .iter()
            .map(|phase| {
                Ok(PodEvent::Updated {
                    phase: *phase,
                    reason: None,
                })
            })
            .collect();

        if self.watch_hangs {
            Ok(stream::iter(events).chain(stream::pending()).boxed())
        } else {
            Ok(stream::iter(events).boxed())
        }
    }

    async fn attach(&self, name: &str, container: &str) -> Result<AttachedSession> {
        assert_eq!(container, "nsenter");
        let done: Result<()> = match self.attach_behavior {
            AttachBehavior::Shell => Ok(()),
            AttachBehavior::Idle => {
                let (remote_stdin, _peer) = tokio::io::duplex(64);
                let stdout = tokio_test::io::Builder::new()
                    .wait(Duration::from_secs(3600))
                    .build();
                return Ok(AttachedSession {
                    stdin: Box::new(remote_stdin),
                    stdout: Box::new(stdout),
                    done: async { Ok(()) }.boxed(),
                });
            }
            AttachBehavior::ExitCode(code) => Err(SshError::SessionExited { code }),
            AttachBehavior::Refused => {
                return Err(SshError::Attach {
                    name: name.to_string(),
                    message: "container nsenter not found".into(),
                })
            }
        };

        let (remote_stdin, _peer) = tokio::io::duplex(64);
        Ok(AttachedSession {
            stdin: Box::new(remote_stdin),
            stdout: Box::new(&b"root@node:/# logout\r\n"[..]),
            done: async move { done }.boxed(),
        })
    }

    async fn delete_pod(&self, name: &str, _grace_period_secs: u32) -> Result<()> {
        self.pods.lock().unwrap().remove(name);
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

fn manager(cluster: FakeCluster) -> SessionManager<FakeCluster> {
    let settings = SessionSettings {
        image: "busybox".to_string(),
        privileged: true,
        watch_timeout: Duration::from_secs(300),
        delete_grace_period_secs: 0,
    };
    SessionManager::new(cluster, settings, NameGenerator::with_seed("ssh-agent-", 42))
}

fn quiet_streams() -> TerminalStreams<tokio::io::Empty, tokio::io::Sink, tokio::io::Sink> {
    TerminalStreams {
        stdin: tokio::io::empty(),
        stdout: tokio::io::sink(),
        stderr: tokio::io::sink(),
        raw_mode: false,
    }
}

/// Resolve the target and run a session the way the binary does
async fn invoke(
    manager: &mut SessionManager<FakeCluster>,
    name: Option<&str>,
    selector: Option<&str>,
    output: &mut Vec<u8>,
) -> Result<String> {
    let node = resolve_node(manager.cluster(), name, selector).await?;
    let streams = TerminalStreams {
        stdin: tokio::io::empty(),
        stdout: output,
        stderr: tokio::io::sink(),
        raw_mode: false,
    };
    manager
        .run(&node, streams, std::future::pending::<()>())
        .await?;
    Ok(node)
}

#[tokio::test]
async fn test_session_on_named_node() {
    let mut manager = manager(FakeCluster::with_nodes(&["node01", "node02"]));
    let mut output = Vec::new();

    let node = invoke(&mut manager, Some("node01"), None, &mut output)
        .await
        .unwrap();

    assert_eq!(node, "node01");
    assert_eq!(output, b"root@node:/# logout\r\n");

    let cluster = manager.cluster();
    let created = cluster.created();
    assert_eq!(created.len(), 1);
    let spec = created[0].spec.as_ref().unwrap();
    assert_eq!(spec.node_name.as_deref(), Some("node01"));
    assert_eq!(spec.host_pid, Some(true));

    let name = created[0].metadata.name.clone().unwrap();
    assert!(name.starts_with("ssh-agent-"));
    assert_eq!(cluster.deleted(), vec![name]);
    assert!(cluster.session_pods_on("node01").is_empty());
}

#[tokio::test]
async fn test_unknown_node_creates_nothing() {
    let mut manager = manager(FakeCluster::with_nodes(&["node01"]));
    let mut output = Vec::new();

    let err = invoke(&mut manager, Some("node99"), None, &mut output)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::NodeNotFound { .. }));
    assert_ne!(err.exit_code(), 0);
    assert!(manager.cluster().created().is_empty());
    assert!(manager.cluster().deleted().is_empty());
}

#[tokio::test]
async fn test_selector_wins_over_positional_name() {
    let cluster = FakeCluster::with_nodes(&["node01", "node07"]).label_node("node07", "role", "edge");
    let mut manager = manager(cluster);
    let mut output = Vec::new();

    let node = invoke(&mut manager, Some("node01"), Some("role=edge"), &mut output)
        .await
        .unwrap();

    assert_eq!(node, "node07");
    assert_eq!(*manager.cluster().node_lists.lock().unwrap(), 1);
    let created = manager.cluster().created();
    assert_eq!(
        created[0].spec.as_ref().unwrap().node_name.as_deref(),
        Some("node07")
    );
    assert!(manager.cluster().session_pods_on("node07").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_deletes_session() {
    let cluster = FakeCluster::with_nodes(&["node01"]).phases(&[SessionPhase::Pending], true);
    let mut manager = manager(cluster);
    let mut output = Vec::new();

    let err = invoke(&mut manager, Some("node01"), None, &mut output)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::Timeout { waited_secs: 300, .. }));
    assert_ne!(err.exit_code(), 0);
    assert_eq!(manager.cluster().deleted().len(), 1);
    assert!(manager.cluster().session_pods_on("node01").is_empty());
    assert!(output.is_empty());
}

#[tokio::test]
async fn test_failed_phase_deletes_session() {
    let cluster = FakeCluster::with_nodes(&["node01"])
        .phases(&[SessionPhase::Pending, SessionPhase::Failed], true);
    let mut manager = manager(cluster);
    let mut output = Vec::new();

    let err = invoke(&mut manager, Some("node01"), None, &mut output)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::Watch { .. }));
    assert!(manager.cluster().session_pods_on("node01").is_empty());
}

#[tokio::test]
async fn test_attach_failure_deletes_session() {
    let cluster = FakeCluster::with_nodes(&["node01"]).attach_behavior(AttachBehavior::Refused);
    let mut manager = manager(cluster);
    let mut output = Vec::new();

    let err = invoke(&mut manager, Some("node01"), None, &mut output)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::Attach { .. }));
    assert_eq!(err.exit_code(), 6);
    assert_eq!(manager.cluster().deleted().len(), 1);
    assert!(manager.cluster().session_pods_on("node01").is_empty());
}

#[tokio::test]
async fn test_remote_exit_code_is_propagated_after_cleanup() {
    let cluster = FakeCluster::with_nodes(&["node01"]).attach_behavior(AttachBehavior::ExitCode(2));
    let mut manager = manager(cluster);
    let mut output = Vec::new();

    let err = invoke(&mut manager, Some("node01"), None, &mut output)
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert!(manager.cluster().session_pods_on("node01").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_wait_deletes_session() {
    let cluster = FakeCluster::with_nodes(&["node01"]).phases(&[SessionPhase::Pending], true);
    let mut manager = manager(cluster);

    let interrupt = tokio::time::sleep(Duration::from_secs(5));

    let err = manager
        .run("node01", quiet_streams(), interrupt)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(manager.cluster().created().len(), 1);
    assert!(manager.cluster().session_pods_on("node01").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_create_deletes_session() {
    let mut cluster = FakeCluster::with_nodes(&["node01"]);
    cluster.create_delay = Some(Duration::from_secs(30));
    let mut manager = manager(cluster);
    let interrupt = tokio::time::sleep(Duration::from_secs(1));

    let err = manager
        .run("node01", quiet_streams(), interrupt)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::Interrupted));
    let created = manager.cluster().created();
    assert_eq!(created.len(), 1);
    assert_eq!(
        manager.cluster().deleted(),
        vec![created[0].metadata.name.clone().unwrap()]
    );
    assert!(manager.cluster().session_pods_on("node01").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_while_attached_deletes_session() {
    let cluster = FakeCluster::with_nodes(&["node01"]).attach_behavior(AttachBehavior::Idle);
    let mut manager = manager(cluster);
    let interrupt = tokio::time::sleep(Duration::from_secs(5));

    let err = manager
        .run("node01", quiet_streams(), interrupt)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(manager.cluster().deleted().len(), 1);
    assert!(manager.cluster().session_pods_on("node01").is_empty());
}

#[tokio::test]
async fn test_dry_run_renders_without_creating() {
    let mut manager = manager(FakeCluster::with_nodes(&["node01"]));

    let node = resolve_node(manager.cluster(), Some("node01"), None)
        .await
        .unwrap();
    let manifest = manager.render_session_pod(&node, "default").unwrap();

    let pod: serde_json::Value = serde_json::from_str(&manifest).unwrap();
    assert_eq!(pod["spec"]["nodeName"], "node01");
    assert_eq!(pod["metadata"]["namespace"], "default");
    assert!(pod["metadata"]["name"]
        .as_str()
        .unwrap()
        .starts_with("ssh-agent-"));
    assert!(manager.cluster().created().is_empty());
    assert!(manager.cluster().deleted().is_empty());
}

#[tokio::test]
async fn test_session_on_node_with_long_name() {
    let node = format!("{}.eu-west-1.compute.internal", "gpu-a100-worker-".repeat(4));
    let mut manager = manager(FakeCluster::with_nodes(&[node.as_str()]));
    let mut output = Vec::new();

    invoke(&mut manager, Some(node.as_str()), None, &mut output)
        .await
        .unwrap();

    let created = manager.cluster().created();
    let meta = &created[0].metadata;
    assert!(meta.labels.as_ref().unwrap()[NODE_LABEL].len() <= 63);
    assert_eq!(meta.annotations.as_ref().unwrap()[NODE_ANNOTATION], node);
    assert!(manager.cluster().session_pods_on(&node).is_empty());
}

#[tokio::test]
async fn test_rejected_create_has_nothing_to_delete() {
    let mut cluster = FakeCluster::with_nodes(&["node01"]);
    cluster.reject_create = true;
    let mut manager = manager(cluster);
    let mut output = Vec::new();

    let err = invoke(&mut manager, Some("node01"), None, &mut output)
        .await
        .unwrap_err();

    assert!(matches!(err, SshError::SessionCreate { .. }));
    assert!(err.to_string().contains("exceeded quota"));
    assert!(manager.cluster().deleted().is_empty());
}

#[tokio::test]
async fn test_each_session_gets_a_fresh_name() {
    let mut manager = manager(FakeCluster::with_nodes(&["node01"]));

    for _ in 0..3 {
        let mut output = Vec::new();
        invoke(&mut manager, Some("node01"), None, &mut output)
            .await
            .unwrap();
    }

    let mut names: Vec<String> = manager
        .cluster()
        .created()
        .into_iter()
        .filter_map(|pod| pod.metadata.name)
        .collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 3);
}
