//! Command line surface of the `kubectl ssh` plugin

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;
use crate::k8s::ConnectionOptions;

const EXAMPLES: &str = "\
Examples:
  # ssh to one node
  kubectl ssh node01

  # ssh to the first node carrying a label
  kubectl ssh -l node-role.kubernetes.io/edge=true";

#[derive(Parser, Debug)]
#[command(name = "kubectl-ssh", bin_name = "kubectl ssh")]
#[command(about = "ssh to specified k8s host node", long_about = None, after_help = EXAMPLES)]
pub struct Args {
    /// Name of the node to open a shell on
    pub node: Option<String>,

    /// Pick the first node matching this label selector (takes precedence over NODE)
    #[arg(short = 'l', long = "label")]
    pub label: Option<String>,

    /// Image of the session pod; must provide nsenter (the shell comes from the host)
    #[arg(long)]
    pub image: Option<String>,

    /// Seconds to wait for the session pod to start running
    #[arg(long = "timeout")]
    pub timeout_secs: Option<u64>,

    /// Print the session pod manifest instead of creating it
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Path to the kubeconfig file to use
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// The name of the kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Namespace the session pod is created in
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

impl Args {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            kubeconfig: self.kubeconfig.clone(),
            context: self.context.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Apply command line overrides on top of the loaded configuration
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(image) = &self.image {
            config.agent_image = image.clone();
        }
        if let Some(secs) = self.timeout_secs {
            config.watch_timeout_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_positional_node() {
        let args = Args::try_parse_from(["kubectl-ssh", "node01"]).unwrap();
        assert_eq!(args.node.as_deref(), Some("node01"));
        assert!(args.label.is_none());
        assert!(!args.dry_run);
    }

    #[test]
    fn test_label_short_flag() {
        let args = Args::try_parse_from(["kubectl-ssh", "-l", "role=edge"]).unwrap();
        assert!(args.node.is_none());
        assert_eq!(args.label.as_deref(), Some("role=edge"));
    }

    #[test]
    fn test_connection_flags_pass_through() {
        let args = Args::try_parse_from([
            "kubectl-ssh",
            "node01",
            "--context",
            "prod",
            "-n",
            "debug",
            "--kubeconfig",
            "/tmp/kubeconfig",
        ])
        .unwrap();
        let options = args.connection_options();
        assert_eq!(options.context.as_deref(), Some("prod"));
        assert_eq!(options.namespace.as_deref(), Some("debug"));
        assert_eq!(options.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
    }

    #[test]
    fn test_more_than_one_node_is_rejected() {
        assert!(Args::try_parse_from(["kubectl-ssh", "node01", "node02"]).is_err());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let args =
            Args::try_parse_from(["kubectl-ssh", "node01", "--image", "alpine:3.19", "--timeout", "30"])
                .unwrap();
        let mut config = Config::default();
        args.apply_to(&mut config);
        assert_eq!(config.agent_image, "alpine:3.19");
        assert_eq!(config.watch_timeout_secs, 30);
    }
}
