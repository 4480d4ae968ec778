//! kubectl-ssh library
//!
//! Shell access to a cluster node's host namespaces through a short-lived,
//! privileged pod pinned to that node.

pub mod cli;
pub mod config;
pub mod error;
pub mod k8s;
pub mod session;

pub use error::{Result, SshError};
