//! Authentication chain for trying multiple strategies.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::identity::IdentityStore;
use crate::session::SessionHandler;

use super::traits::AuthStrategy;
use super::{AgentAuth, IdentityAuth, PasswordAuth};

/// Tries strategies in the order they were added; the first success wins.
///
/// # Example
///
/// ```ignore
/// let chain = AuthChain::new()
///     .with_password("secret")
///     .with_identities(context.agent().clone())
///     .with_agent();
///
/// let ok = chain.authenticate(&mut handle, "username").await?;
/// ```
#[derive(Default)]
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    /// Offer the identities held by `store`.
    pub fn with_identities(mut self, store: Arc<IdentityStore>) -> Self {
        self.strategies.push(Box::new(IdentityAuth::new(store)));
        self
    }

    /// Fall back to the system ssh-agent.
    pub fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth::new()));
        self
    }

    pub fn with_strategy(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SessionHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authentication succeeded with strategy: {}", strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication failed with strategy: {}", strategy.name());
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!("Authentication error with strategy {}: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_chain_empty() {
        let chain = AuthChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn test_auth_chain_preserves_order() {
        let store = Arc::new(IdentityStore::new());
        let chain = AuthChain::new()
            .with_password("pass1")
            .with_identities(store)
            .with_password("pass2")
            .with_agent();

        assert_eq!(chain.names(), vec!["password", "identity", "password", "agent"]);
    }

    #[test]
    fn test_auth_chain_name() {
        assert_eq!(AuthChain::new().name(), "chain");
    }
}
