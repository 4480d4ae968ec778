//! Error taxonomy for node access sessions

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SshError>;

pub const EXIT_GENERIC_FAILURE: i32 = 1;
pub const EXIT_INVALID_ARGUMENT: i32 = 2;
pub const EXIT_NODE_NOT_FOUND: i32 = 3;
pub const EXIT_SESSION_CREATE_FAILURE: i32 = 4;
pub const EXIT_READINESS_FAILURE: i32 = 5;
pub const EXIT_ATTACH_FAILURE: i32 = 6;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no context is currently set, use \"kubectl config use-context <context>\" to select a new one")]
    NoContext,

    #[error("{message}")]
    NodeNotFound { message: String },

    #[error("failed to create session pod {name}: {message}")]
    SessionCreate { name: String, message: String },

    #[error("session pod {name} was not running after {waited_secs}s{}", .last_reason.as_deref().map(|r| format!(" (last reason: {r})")).unwrap_or_default())]
    Timeout {
        name: String,
        waited_secs: u64,
        last_reason: Option<String>,
    },

    #[error("watching session pod {name} failed: {message}")]
    Watch { name: String, message: String },

    #[error("attach to session pod {name} failed: {message}")]
    Attach { name: String, message: String },

    #[error("remote shell exited with status {code}")]
    SessionExited { code: i32 },

    #[error("interrupted")]
    Interrupted,

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("failed to render session pod: {0}")]
    Render(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SshError {
    pub fn node_not_found(name: &str) -> Self {
        SshError::NodeNotFound {
            message: format!(
                "cannot find specified node {name}, use \"kubectl get nodes\" to confirm"
            ),
        }
    }

    pub fn no_node_matches(selector: &str) -> Self {
        SshError::NodeNotFound {
            message: format!(
                "no node matches label selector {selector}, use \"kubectl get nodes -l {selector}\" to confirm"
            ),
        }
    }

    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SshError::InvalidArgument(_) | SshError::NoContext => EXIT_INVALID_ARGUMENT,
            SshError::NodeNotFound { .. } => EXIT_NODE_NOT_FOUND,
            SshError::SessionCreate { .. } => EXIT_SESSION_CREATE_FAILURE,
            SshError::Timeout { .. } | SshError::Watch { .. } => EXIT_READINESS_FAILURE,
            SshError::Attach { .. } => EXIT_ATTACH_FAILURE,
            SshError::SessionExited { code } if *code != 0 => *code,
            SshError::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_GENERIC_FAILURE,
        }
    }
}
