//! Kubernetes integration module for kubectl-ssh
//!
//! This module handles all interactions with the cluster:
//! - Resolving the target node
//! - Building the privileged session pod
//! - Watching the session pod until it is running
//! - Creating, attaching to and deleting session pods

mod client;
mod resolver;
mod resources;
mod watcher;

pub use client::{
    AttachedSession, ClusterApi, ConnectionOptions, K8sClient, PodEventStream, WATCH_WINDOW_SECS,
};
#[cfg(test)]
pub use client::MockClusterApi;
pub use resolver::resolve_node;
pub use resources::{
    create_session_pod, node_label_value, nsenter_command, session_labels, session_selector,
    NameGenerator, SessionSpec, DEFAULT_AGENT_IMAGE, NODE_ANNOTATION, NODE_LABEL,
    SESSION_CONTAINER,
};
pub use watcher::{await_running, PodEvent, SessionPhase};
