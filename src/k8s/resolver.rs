//! Target node resolution

use tracing::{info, instrument, warn};

use super::client::ClusterApi;
use crate::error::{Result, SshError};

/// Resolve the node a session is pinned to.
///
/// A label selector takes precedence over a positional name: the first node
/// the API lists for the selector wins. Without a selector the name must
/// match a node exactly. Exactly one node list call is made.
#[instrument(skip(cluster))]
pub async fn resolve_node<C>(
    cluster: &C,
    name: Option<&str>,
    label_selector: Option<&str>,
) -> Result<String>
where
    C: ClusterApi + ?Sized,
{
    let name = name.filter(|n| !n.is_empty());
    let label_selector = label_selector.filter(|s| !s.is_empty());

    match (name, label_selector) {
        (_, Some(selector)) => {
            let nodes = cluster.list_nodes(selector).await?;
            let node = nodes
                .into_iter()
                .next()
                .ok_or_else(|| SshError::no_node_matches(selector))?;

            if let Some(name) = name.filter(|n| *n != node) {
                warn!(
                    requested = name,
                    resolved = %node,
                    "Label selector takes precedence over the node name"
                );
            }
            info!(node = %node, selector, "Resolved target node");
            Ok(node)
        }
        (Some(name), None) => {
            let nodes = cluster.list_nodes("").await?;
            let node = nodes
                .into_iter()
                .find(|n| n == name)
                .ok_or_else(|| SshError::node_not_found(name))?;

            info!(node = %node, "Resolved target node");
            Ok(node)
        }
        (None, None) => Err(SshError::InvalidArgument(
            "must specify one node, by name or with --label".into(),
        )),
    }
}
