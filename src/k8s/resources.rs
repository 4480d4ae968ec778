//! Kubernetes resource builders for kubectl-ssh
//!
//! Builds the short-lived privileged pod that hosts the nsenter step

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, SecurityContext, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Default container image for session pods
pub const DEFAULT_AGENT_IMAGE: &str = "busybox";

/// Name of the single container in a session pod
pub const SESSION_CONTAINER: &str = "nsenter";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kubectl-ssh";
pub const NODE_LABEL: &str = "kubectl-ssh.io/node";
/// Carries the full node name, which may not fit a label value
pub const NODE_ANNOTATION: &str = "kubectl-ssh.io/node-name";

const LABEL_VALUE_MAX_LEN: usize = 63;
const LABEL_DIGEST_LEN: usize = 10;

const NAME_SUFFIX_LEN: usize = 8;
const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Join the host init process' namespaces, then start a login shell.
///
/// After `--mount` the shell is looked up on the host's root filesystem, so
/// the image only needs `nsenter`.
pub fn nsenter_command() -> Vec<String> {
    [
        "nsenter", "--target", "1", "--mount", "--uts", "--ipc", "--net", "--pid", "--", "bash",
        "-l",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Value of the [`NODE_LABEL`] label for `node_name`.
///
/// Node names may be up to 253 characters, label values only 63. Longer names
/// are cut and suffixed with a digest of the full name so the value stays
/// unique per node.
pub fn node_label_value(node_name: &str) -> String {
    if node_name.len() <= LABEL_VALUE_MAX_LEN {
        return node_name.to_string();
    }

    let digest: String = Sha256::digest(node_name.as_bytes())
        .iter()
        .take(LABEL_DIGEST_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    let head: String = node_name
        .chars()
        .take(LABEL_VALUE_MAX_LEN - LABEL_DIGEST_LEN - 1)
        .collect();
    // Label values must end in an alphanumeric before the separator too
    let head = head.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{head}-{digest}")
}

/// Label selector matching every session pod bound to `node_name`
pub fn session_selector(node_name: &str) -> String {
    format!(
        "{MANAGED_BY_LABEL}={MANAGED_BY},{NODE_LABEL}={}",
        node_label_value(node_name)
    )
}

/// Create labels for a session pod
pub fn session_labels(node_name: &str) -> BTreeMap<String, String> {
    [
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (NODE_LABEL.to_string(), node_label_value(node_name)),
    ]
    .into_iter()
    .collect()
}

/// Inputs of a session pod
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub name: String,
    pub node_name: String,
    pub image: String,
    pub privileged: bool,
}

/// Create the Pod spec of an access session pinned to `spec.node_name`
pub fn create_session_pod(spec: &SessionSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(session_labels(&spec.node_name)),
            annotations: Some(BTreeMap::from([(
                NODE_ANNOTATION.to_string(),
                spec.node_name.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            // Bypasses the scheduler: the pod lands on this node or nowhere
            node_name: Some(spec.node_name.clone()),
            host_pid: Some(true),
            containers: vec![Container {
                name: SESSION_CONTAINER.to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(nsenter_command()),
                security_context: Some(SecurityContext {
                    privileged: Some(spec.privileged),
                    ..Default::default()
                }),
                stdin: Some(true),
                stdin_once: Some(true),
                tty: Some(true),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            // Tainted nodes (control plane, NoExecute) must still be reachable
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generates collision-resistant session pod names.
///
/// One instance is created per process and seeded once; uniqueness matters
/// here, unpredictability does not.
#[derive(Debug)]
pub struct NameGenerator {
    prefix: String,
    rng: SmallRng,
}

impl NameGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Deterministic generator, for reproducible names
    pub fn with_seed(prefix: impl Into<String>, seed: u64) -> Self {
        Self {
            prefix: prefix.into(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn next_name(&mut self) -> String {
        let suffix: String = (0..NAME_SUFFIX_LEN)
            .map(|_| NAME_CHARSET[self.rng.gen_range(0..NAME_CHARSET.len())] as char)
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}
