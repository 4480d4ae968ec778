use serde::Deserialize;
use std::time::Duration;

use crate::error::Result;
use crate::k8s::DEFAULT_AGENT_IMAGE;

/// Environment variable prefix, e.g. `KUBECTL_SSH_AGENT_IMAGE=alpine:3.19`
pub const ENV_PREFIX: &str = "KUBECTL_SSH";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_agent_image")]
    pub agent_image: String,

    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,

    #[serde(default = "default_delete_grace_period_secs")]
    pub delete_grace_period_secs: u32,

    #[serde(default = "default_privileged")]
    pub privileged: bool,
}

fn default_agent_image() -> String {
    DEFAULT_AGENT_IMAGE.to_string()
}

fn default_name_prefix() -> String {
    "ssh-agent-".to_string()
}

fn default_watch_timeout_secs() -> u64 {
    300
}

fn default_delete_grace_period_secs() -> u32 {
    0
}

fn default_privileged() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = ::config::Config::builder()
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_image: default_agent_image(),
            name_prefix: default_name_prefix(),
            watch_timeout_secs: default_watch_timeout_secs(),
            delete_grace_period_secs: default_delete_grace_period_secs(),
            privileged: default_privileged(),
        }
    }
}
