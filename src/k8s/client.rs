//! Kubernetes client wrapper for kubectl-ssh

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::{future::BoxFuture, stream, stream::BoxStream, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument};

use super::watcher::PodEvent;
use crate::error::{Result, SshError};

/// Stream of state changes for a single watched pod
pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

/// Server-side lifetime of one watch request. The API server closes the
/// response after it and kube rejects anything above 295s.
pub const WATCH_WINDOW_SECS: u32 = 290;

type RawPodEvents = BoxStream<'static, kube::Result<WatchEvent<Pod>>>;

/// Live interactive streams of an attached session container.
///
/// `done` resolves once the remote side has closed the attach connection and
/// reports how the remote process ended.
pub struct AttachedSession {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub done: BoxFuture<'static, Result<()>>,
}

/// Cluster primitives the session orchestrator depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of the cluster nodes matching `label_selector` (all nodes when
    /// empty), in API list order.
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<String>>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Watch exactly one pod by name. The stream only ends after an error.
    async fn watch_pod(&self, name: &str) -> Result<PodEventStream>;

    async fn attach(&self, name: &str, container: &str) -> Result<AttachedSession>;

    /// Delete a pod; an already missing pod is not an error.
    async fn delete_pod(&self, name: &str, grace_period_secs: u32) -> Result<()>;
}

/// Standard cluster connection flags, passed through unmodified
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub namespace: Option<String>,
}

/// Wrapper around kube::Client bound to one context and namespace
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    namespace: String,
}

impl K8sClient {
    /// Connect using the kubeconfig and context selected by `options`
    #[instrument(skip_all, fields(context = ?options.context))]
    pub async fn connect(options: &ConnectionOptions) -> Result<Self> {
        let kubeconfig = match &options.kubeconfig {
            Some(path) => Kubeconfig::read_from(path)?,
            None => Kubeconfig::read()?,
        };

        if options.context.is_none()
            && kubeconfig
                .current_context
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(SshError::NoContext);
        }

        let kube_options = KubeConfigOptions {
            context: options.context.clone(),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &kube_options).await?;
        let namespace = options
            .namespace
            .clone()
            .unwrap_or_else(|| config.default_namespace.clone());
        let client = Client::try_from(config)?;

        info!(namespace = %namespace, "Connected to Kubernetes cluster");

        Ok(Self { client, namespace })
    }

    /// Get the namespace this client operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterApi for K8sClient {
    #[instrument(skip(self))]
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<String>> {
        let params = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(label_selector)
        };
        let list = self.nodes().list(&params).await?;
        debug!(count = list.items.len(), "Listed nodes");
        Ok(list
            .items
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect())
    }

    #[instrument(skip(self, pod), fields(pod_name = %pod.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let created = self
            .pods()
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| SshError::SessionCreate {
                name,
                message: api_message(&e),
            })?;
        info!("Created pod");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn watch_pod(&self, name: &str) -> Result<PodEventStream> {
        let pods = self.pods();
        let params = WatchParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(WATCH_WINDOW_SECS);

        Ok(follow_pod(name, move |version: String| {
            let pods = pods.clone();
            let params = params.clone();
            async move { pods.watch(&params, &version).await.map(|s| s.boxed()) }
        }))
    }

    #[instrument(skip(self))]
    async fn attach(&self, name: &str, container: &str) -> Result<AttachedSession> {
        let params = AttachParams::interactive_tty().container(container);
        let attach_error = |message: String| SshError::Attach {
            name: name.to_string(),
            message,
        };

        let mut attached = self
            .pods()
            .attach(name, &params)
            .await
            .map_err(|e| attach_error(api_message(&e)))?;

        let stdin = attached
            .stdin()
            .ok_or_else(|| attach_error("stdin not available".into()))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| attach_error("stdout not available".into()))?;
        let status = attached.take_status();

        let pod_name = name.to_string();
        let done = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            attached.join().await.map_err(|e| SshError::Attach {
                name: pod_name,
                message: e.to_string(),
            })?;
            check_exit_status(status)
        }
        .boxed();

        info!("Attached to session container");

        Ok(AttachedSession {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            done,
        })
    }

    #[instrument(skip(self))]
    async fn delete_pod(&self, name: &str, grace_period_secs: u32) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_period_secs),
            ..Default::default()
        };
        match self.pods().delete(name, &params).await {
            Ok(_) => {
                info!(name, "Deleted pod");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(name, "Pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct WatchState<F> {
    name: String,
    open_window: F,
    resource_version: String,
    window: Option<RawPodEvents>,
    finished: bool,
}

impl<F> WatchState<F> {
    fn fail(&mut self, message: String) -> SshError {
        self.finished = true;
        self.window = None;
        SshError::Watch {
            name: self.name.clone(),
            message,
        }
    }
}

/// Follow one pod across consecutive server watch windows.
///
/// A window the server closes cleanly is reopened from the last seen resource
/// version, so the caller's deadline decides how long the wait lasts. Errors
/// end the stream.
fn follow_pod<F, Fut>(name: &str, open_window: F) -> PodEventStream
where
    F: FnMut(String) -> Fut + Send + 'static,
    Fut: Future<Output = kube::Result<RawPodEvents>> + Send + 'static,
{
    let state = WatchState {
        name: name.to_string(),
        open_window,
        resource_version: "0".into(),
        window: None,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            if state.window.is_none() {
                match (state.open_window)(state.resource_version.clone()).await {
                    Ok(window) => state.window = Some(window),
                    Err(e) => {
                        let err = state.fail(api_message(&e));
                        return Some((Err(err), state));
                    }
                }
            }
            let Some(window) = state.window.as_mut() else {
                continue;
            };

            match window.next().await {
                Some(Ok(WatchEvent::Added(pod) | WatchEvent::Modified(pod))) => {
                    if let Some(version) = &pod.metadata.resource_version {
                        state.resource_version = version.clone();
                    }
                    return Some((Ok(PodEvent::from_pod(&pod)), state));
                }
                Some(Ok(WatchEvent::Deleted(_))) => return Some((Ok(PodEvent::Deleted), state)),
                Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                    state.resource_version = bookmark.metadata.resource_version;
                }
                Some(Ok(WatchEvent::Error(resp))) => {
                    let err = state.fail(resp.message);
                    return Some((Err(err), state));
                }
                Some(Err(e)) => {
                    let err = state.fail(e.to_string());
                    return Some((Err(err), state));
                }
                None => {
                    debug!(
                        name = %state.name,
                        resource_version = %state.resource_version,
                        "Watch window closed, reopening"
                    );
                    state.window = None;
                }
            }
        }
    })
    .boxed()
}

/// Prefer the API server's message over the full error chain
fn api_message(err: &kube::Error) -> String {
    match err {
        kube::Error::Api(resp) => resp.message.clone(),
        other => other.to_string(),
    }
}

/// Map the remote command status to a session outcome
fn check_exit_status(status: Option<Status>) -> Result<()> {
    let Some(status) = status else {
        return Ok(());
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }

    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse::<i32>().ok())
        });

    match code {
        Some(code) => Err(SshError::SessionExited { code }),
        None => Err(SshError::Attach {
            name: status
                .details
                .and_then(|d| d.name)
                .unwrap_or_default(),
            message: status.message.unwrap_or_else(|| "remote session failed".into()),
        }),
    }
}
