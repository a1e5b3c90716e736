//! Service configuration with builder pattern

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::orchestrator::{DuplicatePolicy, OrchestratorConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the REST API listens on
    pub bind: SocketAddr,
    pub duplicate_policy: DuplicatePolicy,
    /// How long finished tasks stay queryable
    pub task_retention_secs: u64,
    /// Replaces the per-operation wait before a mutation answers 202
    pub wait_for_ms: Option<u64>,
    pub cache_stale_period_ms: u64,
    pub cache_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            duplicate_policy: DuplicatePolicy::Reject,
            task_retention_secs: 600,
            wait_for_ms: None,
            cache_stale_period_ms: 5_000,
            cache_timeout_ms: 5_000,
        }
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ServiceConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.task_retention_secs == 0 {
            return Err(crate::Error::Config("task_retention_secs must be positive".into()));
        }
        if self.cache_timeout_ms == 0 {
            return Err(crate::Error::Config("cache_timeout_ms must be positive".into()));
        }
        if self.wait_for_ms.is_some_and(|ms| ms > 60_000) {
            return Err(crate::Error::Config("wait_for_ms cannot exceed one minute".into()));
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            duplicate_policy: self.duplicate_policy,
            task_retention: Duration::from_secs(self.task_retention_secs),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            stale_period: Duration::from_millis(self.cache_stale_period_ms),
            timeout: Duration::from_millis(self.cache_timeout_ms),
        }
    }

    /// Wait for an operation whose own default is `default`
    pub fn wait_for(&self, default: Duration) -> Duration {
        self.wait_for_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

#[derive(Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind = addr;
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    pub fn task_retention_secs(mut self, secs: u64) -> Self {
        self.config.task_retention_secs = secs;
        self
    }

    pub fn wait_for_ms(mut self, ms: u64) -> Self {
        self.config.wait_for_ms = Some(ms);
        self
    }

    pub fn cache_stale_period_ms(mut self, ms: u64) -> Self {
        self.config.cache_stale_period_ms = ms;
        self
    }

    pub fn cache_timeout_ms(mut self, ms: u64) -> Self {
        self.config.cache_timeout_ms = ms;
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<ServiceConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
