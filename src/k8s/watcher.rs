//! Session readiness watcher
//!
//! Follows the phase of a single session pod until it is attachable. The
//! event stream is consumed exactly once: if it breaks or ends before the pod
//! runs, that is an error. Reopening expired server windows is the client's
//! job.

use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use strum::Display;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SshError};

/// Pod phase as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for SessionPhase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => SessionPhase::Pending,
            "Running" => SessionPhase::Running,
            "Succeeded" => SessionPhase::Succeeded,
            "Failed" => SessionPhase::Failed,
            _ => SessionPhase::Unknown,
        }
    }
}

impl SessionPhase {
    /// A session in a terminal phase can never become attachable
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Succeeded | SessionPhase::Failed)
    }
}

/// One observed change of the watched session pod
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Updated {
        phase: SessionPhase,
        reason: Option<String>,
    },
    Deleted,
}

impl PodEvent {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = status
            .and_then(|s| s.phase.as_deref())
            .map(SessionPhase::from)
            .unwrap_or(SessionPhase::Pending);

        // Container waiting reasons (ErrImagePull, ContainerCreating...) say
        // more than the pod-level reason while the pod is pending.
        let reason = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses.iter().find_map(|cs| {
                    cs.state
                        .as_ref()
                        .and_then(|state| state.waiting.as_ref())
                        .and_then(|waiting| waiting.reason.clone())
                })
            })
            .or_else(|| status.and_then(|s| s.reason.clone()));

        PodEvent::Updated { phase, reason }
    }
}

/// Block until the session pod reports `Running`.
///
/// Fails with [`SshError::Timeout`] when `deadline` elapses first and with
/// [`SshError::Watch`] as soon as the pod ends up in a terminal phase, is
/// deleted, or the event stream breaks.
pub async fn await_running<S>(name: &str, events: S, deadline: Duration) -> Result<()>
where
    S: Stream<Item = Result<PodEvent>> + Unpin,
{
    let started = Instant::now();
    let mut last_reason: Option<String> = None;

    match tokio::time::timeout(deadline, follow(name, events, &mut last_reason)).await {
        Ok(result) => {
            if result.is_ok() {
                info!(name, elapsed = ?started.elapsed(), "Session pod is running");
            }
            result
        }
        Err(_) => {
            warn!(name, ?last_reason, "Timed out waiting for session pod");
            Err(SshError::Timeout {
                name: name.to_string(),
                waited_secs: deadline.as_secs(),
                last_reason,
            })
        }
    }
}

async fn follow<S>(name: &str, mut events: S, last_reason: &mut Option<String>) -> Result<()>
where
    S: Stream<Item = Result<PodEvent>> + Unpin,
{
    while let Some(event) = events.next().await {
        match event? {
            PodEvent::Updated { phase, reason } => {
                debug!(name, %phase, ?reason, "Session pod event");
                if reason.is_some() {
                    *last_reason = reason.clone();
                }

                if phase == SessionPhase::Running {
                    return Ok(());
                }
                if phase.is_terminal() {
                    let detail = reason.map(|r| format!(" ({r})")).unwrap_or_default();
                    return Err(SshError::Watch {
                        name: name.to_string(),
                        message: format!("pod reached phase {phase} before running{detail}"),
                    });
                }
            }
            PodEvent::Deleted => {
                return Err(SshError::Watch {
                    name: name.to_string(),
                    message: "pod was deleted before running".into(),
                });
            }
        }
    }

    Err(SshError::Watch {
        name: name.to_string(),
        message: "watch stream closed before the pod was running".into(),
    })
}
