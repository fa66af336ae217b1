//! Explicit context shared by sessions.
//!
//! A context bundles the identity store sessions authenticate with, the
//! transport log-level map and the client configuration. There is one
//! process-wide default, created on first use by [`SshContext::shared`].
//! Alternative contexts are ordinary values: derive one with
//! [`SshContext::with_agent`] or [`SshContext::with_log_levels`] and hand it to
//! the sessions that need it. Nothing is rebound globally.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::ClientConfig;
use crate::identity::IdentityStore;
use crate::logging::LogLevelMap;

static DEFAULT_CONTEXT: Lazy<SshContext> = Lazy::new(|| SshContext {
    agent: Arc::new(IdentityStore::new()),
    log_levels: Arc::new(LogLevelMap::default()),
    config: Arc::new(ClientConfig::from_env()),
});

#[derive(Debug, Clone)]
pub struct SshContext {
    agent: Arc<IdentityStore>,
    log_levels: Arc<LogLevelMap>,
    config: Arc<ClientConfig>,
}

impl Default for SshContext {
    fn default() -> Self {
        Self::shared()
    }
}

impl SshContext {
    /// The process-wide default context, created on first use.
    pub fn shared() -> Self {
        DEFAULT_CONTEXT.clone()
    }

    /// A context independent of the process-wide default.
    pub fn new(agent: Arc<IdentityStore>, log_levels: LogLevelMap, config: ClientConfig) -> Self {
        Self {
            agent,
            log_levels: Arc::new(log_levels),
            config: Arc::new(config),
        }
    }

    /// Same context with a different identity store.
    pub fn with_agent(&self, agent: Arc<IdentityStore>) -> Self {
        Self {
            agent,
            ..self.clone()
        }
    }

    /// Same context with a different log-level map.
    pub fn with_log_levels(&self, log_levels: LogLevelMap) -> Self {
        Self {
            log_levels: Arc::new(log_levels),
            ..self.clone()
        }
    }

    /// Same context with a different client configuration.
    pub fn with_config(&self, config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..self.clone()
        }
    }

    pub fn agent(&self) -> &Arc<IdentityStore> {
        &self.agent
    }

    pub fn log_levels(&self) -> &LogLevelMap {
        &self.log_levels
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
