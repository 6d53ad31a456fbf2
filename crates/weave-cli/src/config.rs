use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use weave_client::ServiceConfig;
use weave_core::ExecutorConfig;

/// Contents of `weave.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub service: ServiceSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".weave")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub namespace: Option<String>,

    /// Name of the environment variable holding the access token.
    #[serde(default)]
    pub token_env: Option<String>,

    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_endpoint() -> String {
    "local".to_string()
}

fn default_verify_tls() -> bool {
    true
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            namespace: None,
            token_env: None,
            verify_tls: default_verify_tls(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolves the service section, reading the token from `token_env` via `lookup`.
    pub fn service_config<F>(&self, lookup: F) -> ServiceConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        ServiceConfig {
            endpoint: self.service.endpoint.clone(),
            namespace: self.service.namespace.clone(),
            token: self.service.token_env.as_deref().and_then(lookup),
            verify_tls: self.service.verify_tls,
        }
    }
}
