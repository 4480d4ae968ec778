//! Access session lifecycle
//!
//! Creates the session pod, waits for it, attaches the local terminal and
//! removes the pod again on every exit path.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, instrument, warn};

use super::attach::{pump, RawModeGuard, TerminalStreams};
use crate::config::Config;
use crate::error::{Result, SshError};
use crate::k8s::{
    await_running, create_session_pod, session_selector, ClusterApi, NameGenerator, SessionSpec,
    SESSION_CONTAINER,
};

const PROMPT_HINT: &[u8] = b"If you don't see a command prompt, try pressing enter.\n";

/// Settings of the sessions a [`SessionManager`] creates
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub image: String,
    pub privileged: bool,
    pub watch_timeout: Duration,
    pub delete_grace_period_secs: u32,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            image: config.agent_image.clone(),
            privileged: config.privileged,
            watch_timeout: config.watch_timeout(),
            delete_grace_period_secs: config.delete_grace_period_secs,
        }
    }
}

/// Runs access sessions against one cluster
pub struct SessionManager<C> {
    cluster: C,
    settings: SessionSettings,
    names: NameGenerator,
}

impl<C: ClusterApi> SessionManager<C> {
    pub fn new(cluster: C, settings: SessionSettings, names: NameGenerator) -> Self {
        Self {
            cluster,
            settings,
            names,
        }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Build the pod of the next session bound to `node_name`
    pub fn session_pod(&mut self, node_name: &str) -> Pod {
        create_session_pod(&SessionSpec {
            name: self.names.next_name(),
            node_name: node_name.to_string(),
            image: self.settings.image.clone(),
            privileged: self.settings.privileged,
        })
    }

    /// Render the pod the next session on `node_name` would create, without
    /// creating it.
    pub fn render_session_pod(&mut self, node_name: &str, namespace: &str) -> Result<String> {
        let mut pod = self.session_pod(node_name);
        pod.metadata.namespace = Some(namespace.to_string());
        Ok(serde_json::to_string_pretty(&pod)?)
    }

    /// Run one interactive session on `node_name`.
    ///
    /// Once the create request is sent the pod is deleted before this returns,
    /// whether the shell exited, something failed, or `shutdown` fired.
    #[instrument(skip(self, streams, shutdown))]
    pub async fn run<I, O, E, S>(
        &mut self,
        node_name: &str,
        streams: TerminalStreams<I, O, E>,
        shutdown: S,
    ) -> Result<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let pod = self.session_pod(node_name);
        let name = pod.metadata.name.clone().unwrap_or_default();
        tokio::pin!(shutdown);

        let created = tokio::select! {
            res = self.cluster.create_pod(&pod) => Some(res),
            _ = &mut shutdown => None,
        };
        match created {
            // A failed create leaves nothing behind to clean up
            Some(Err(e)) => return Err(e),
            Some(Ok(_)) => info!(name = %name, "Session pod created"),
            None => {
                // The request may have landed even though no response arrived
                warn!(name = %name, "Interrupted while creating session pod");
                self.teardown(&name, node_name).await;
                return Err(SshError::Interrupted);
            }
        }

        let outcome = tokio::select! {
            res = self.attach_when_running(&name, streams) => res,
            _ = &mut shutdown => {
                warn!(name = %name, "Interrupted, tearing down session");
                Err(SshError::Interrupted)
            }
        };

        self.teardown(&name, node_name).await;
        outcome
    }

    async fn attach_when_running<I, O, E>(
        &self,
        name: &str,
        streams: TerminalStreams<I, O, E>,
    ) -> Result<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let TerminalStreams {
            stdin,
            stdout,
            mut stderr,
            raw_mode,
        } = streams;

        let events = self.cluster.watch_pod(name).await?;
        await_running(name, events, self.settings.watch_timeout).await?;

        let session = self.cluster.attach(name, SESSION_CONTAINER).await?;
        stderr.write_all(PROMPT_HINT).await?;
        stderr.flush().await?;

        let _raw = raw_mode.then(RawModeGuard::acquire);
        pump(name, session, stdin, stdout).await
    }

    async fn teardown(&self, name: &str, node_name: &str) {
        if let Err(e) = self
            .cluster
            .delete_pod(name, self.settings.delete_grace_period_secs)
            .await
        {
            error!(
                name,
                error = %e,
                selector = %session_selector(node_name),
                "Failed to delete session pod, remove it manually"
            );
        }
    }
}
