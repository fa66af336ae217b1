//! Public-key authentication with identities from an [`IdentityStore`].

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::identity::IdentityStore;
use crate::session::SessionHandler;

use super::traits::AuthStrategy;

/// Offers every identity in the store, in insertion order.
///
/// Encrypted identities whose passphrase cannot be resolved are skipped.
pub struct IdentityAuth {
    store: Arc<IdentityStore>,
}

impl IdentityAuth {
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthStrategy for IdentityAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SessionHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let identities = self.store.identities();
        if identities.is_empty() {
            return Err("No identities in store".to_string());
        }

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        for identity in identities {
            let key = match identity.decode(self.store.resolver()).await {
                Ok(key) => key,
                Err(Error::PassphraseNotFound { identity: name }) => {
                    debug!("Skipping {}: no passphrase available", name);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping identity {}: {}", identity.name(), e);
                    continue;
                }
            };

            let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
            match handle.authenticate_publickey(username, key_with_hash).await {
                Ok(result) if result.success() => {
                    info!("Authenticated with identity {}", identity.name());
                    return Ok(true);
                }
                Ok(_) => debug!("Identity {} not accepted, trying next...", identity.name()),
                Err(e) => {
                    return Err(format!("Key authentication failed: {}", e));
                }
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}
