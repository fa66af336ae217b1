//! Pluggable passphrase resolution for encrypted identities.
//!
//! A resolver is asked at most once per identity per store lifetime. The
//! answer, including "no passphrase available", is cached on the identity.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

/// Environment variable consulted by [`EnvPassphrase`] when no per-identity
/// variable is set.
pub const PASSPHRASE_ENV_VAR: &str = "SSH_KEY_PASSPHRASE";

/// Source of passphrases for encrypted private keys.
///
/// Implementations stand in for a keychain or an interactive prompt.
#[async_trait]
pub trait PassphraseResolver: Send + Sync {
    /// Look up the passphrase for the named identity.
    ///
    /// # Returns
    ///
    /// * `Some(passphrase)` - A passphrase was found
    /// * `None` - This resolver has nothing for the identity
    async fn resolve(&self, identity: &str) -> Option<String>;

    fn name(&self) -> &'static str;
}

/// Resolver that never produces a passphrase.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPassphrase;

#[async_trait]
impl PassphraseResolver for NoPassphrase {
    async fn resolve(&self, _identity: &str) -> Option<String> {
        None
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Resolver that answers every identity with the same passphrase.
#[derive(Clone)]
pub struct StaticPassphrase {
    passphrase: String,
}

impl StaticPassphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
        }
    }
}

#[async_trait]
impl PassphraseResolver for StaticPassphrase {
    async fn resolve(&self, _identity: &str) -> Option<String> {
        Some(self.passphrase.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Resolver backed by environment variables.
///
/// Checks `SSH_KEY_PASSPHRASE_<IDENTITY>` first (identity name upper-cased,
/// non-alphanumerics replaced by `_`), then [`PASSPHRASE_ENV_VAR`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvPassphrase;

impl EnvPassphrase {
    pub(crate) fn identity_var(identity: &str) -> String {
        let suffix: String = identity
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{PASSPHRASE_ENV_VAR}_{suffix}")
    }
}

#[async_trait]
impl PassphraseResolver for EnvPassphrase {
    async fn resolve(&self, identity: &str) -> Option<String> {
        env::var(Self::identity_var(identity))
            .or_else(|_| env::var(PASSPHRASE_ENV_VAR))
            .ok()
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

/// Ordered list of resolvers; the first answer wins.
#[derive(Default, Clone)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn PassphraseResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl PassphraseResolver + 'static) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl PassphraseResolver for ResolverChain {
    async fn resolve(&self, identity: &str) -> Option<String> {
        for resolver in &self.resolvers {
            if let Some(passphrase) = resolver.resolve(identity).await {
                debug!(
                    "Passphrase for identity {} provided by {} resolver",
                    identity,
                    resolver.name()
                );
                return Some(passphrase);
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
