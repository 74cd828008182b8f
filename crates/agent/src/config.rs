//! Agent configuration

use std::collections::HashMap;
use std::path::PathBuf;

use agent_lib::{CacheLocation, NamespaceScope};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

/// Environment variable naming the notification destination
const SLACK_URL_VAR: &str = "SLACK_URL";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name attached to every structured log record
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Webhook receiving the notifications, taken from `SLACK_URL`
    pub webhook_url: String,

    /// Directory of a persistent deduplication cache
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Restrict OOM scans to one namespace
    #[serde(default)]
    pub scan_namespace: Option<String>,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "oom-notifier".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl AgentConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::vars().collect())
    }

    /// Load configuration from an explicit variable map
    pub fn load_from(vars: HashMap<String, String>) -> Result<Self> {
        let webhook_url = vars.get(SLACK_URL_VAR).cloned();

        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("OOMWATCH")
                    .try_parsing(true)
                    .source(Some(vars)),
            )
            .set_override_option("webhook_url", webhook_url)?
            .build()?;

        let agent: AgentConfig = config
            .try_deserialize()
            .with_context(|| format!("{} must name the notification webhook", SLACK_URL_VAR))?;
        agent.destination()?;

        Ok(agent)
    }

    /// Parsed webhook URL
    pub fn destination(&self) -> Result<Url> {
        let url = Url::parse(&self.webhook_url)
            .with_context(|| format!("{} is not a valid URL", SLACK_URL_VAR))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("{} must be an http(s) URL, got {}", SLACK_URL_VAR, url.scheme());
        }
        Ok(url)
    }

    pub fn cache_location(&self) -> CacheLocation {
        match &self.cache_path {
            Some(path) => CacheLocation::Persistent(path.clone()),
            None => CacheLocation::Ephemeral,
        }
    }

    pub fn scan_scope(&self) -> NamespaceScope {
        match self.scan_namespace.as_deref() {
            Some(ns) if !ns.is_empty() => NamespaceScope::namespace(ns),
            _ => NamespaceScope::All,
        }
    }
}
