//! In-process identity store.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::passphrase::{EnvPassphrase, PassphraseResolver};
use super::Identity;
use crate::error::{Error, Result};

/// Description of an identity to add to a store.
///
/// Fields are consulted in priority order: a constructed [`Identity`], raw
/// private key bytes, a private and public key path pair, a private key path
/// alone.
#[derive(Default)]
pub struct IdentitySpec {
    identity: Option<Identity>,
    name: Option<String>,
    private_key: Option<Vec<u8>>,
    public_key: Option<Vec<u8>>,
    private_key_path: Option<PathBuf>,
    public_key_path: Option<PathBuf>,
    passphrase: Option<String>,
}

impl IdentitySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn private_key(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.private_key = Some(bytes.into());
        self
    }

    pub fn public_key(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.public_key = Some(bytes.into());
        self
    }

    pub fn private_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn public_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.public_key_path = Some(path.into());
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Name the built identity would be stored under, when knowable up front.
    fn lookup_name(&self) -> Option<String> {
        if let Some(identity) = &self.identity {
            return Some(identity.name.clone());
        }
        self.name.clone().or_else(|| {
            self.private_key_path
                .as_ref()
                .filter(|_| self.private_key.is_none())
                .map(|p| p.display().to_string())
        })
    }

    async fn build(self) -> Result<Identity> {
        if let Some(identity) = self.identity {
            return Ok(identity);
        }

        if let Some(private_key) = self.private_key {
            let name = self
                .name
                .unwrap_or_else(|| format!("identity-{}", Uuid::new_v4()));
            return Identity::from_bytes(name, private_key, self.public_key, self.passphrase);
        }

        if let Some(private_path) = self.private_key_path {
            let mut identity = Identity::from_paths(
                &private_path,
                self.public_key_path.as_deref(),
                self.passphrase,
            )
            .await?;
            if let Some(name) = self.name {
                identity.name = name;
            }
            return Ok(identity);
        }

        Err(Error::UnknownIdentityConstruction(
            "expected an identity, private key bytes or a private key path".to_string(),
        ))
    }
}

/// Agent-like holder of identities offered during authentication.
pub struct IdentityStore {
    identities: DashMap<String, (u64, Arc<Identity>)>,
    next_seq: AtomicU64,
    resolver: Arc<dyn PassphraseResolver>,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("identities", &self.identity_names())
            .field("resolver", &self.resolver.name())
            .finish()
    }
}

impl IdentityStore {
    /// Empty store resolving passphrases from the environment.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(EnvPassphrase))
    }

    pub fn with_resolver(resolver: Arc<dyn PassphraseResolver>) -> Self {
        Self {
            identities: DashMap::new(),
            next_seq: AtomicU64::new(0),
            resolver,
        }
    }

    pub fn resolver(&self) -> &dyn PassphraseResolver {
        self.resolver.as_ref()
    }

    /// Build an identity from `spec` and add it, replacing any identity with
    /// the same name while keeping its position.
    pub async fn add_identity(&self, spec: IdentitySpec) -> Result<Arc<Identity>> {
        let identity = spec.build().await?;
        Ok(self.insert(identity))
    }

    /// Add an identity unless one with the same name is already present.
    ///
    /// Encrypted identities have their passphrase resolved before they are
    /// added; if no resolver has one the identity is not added and
    /// [`Error::PassphraseNotFound`] is returned.
    pub async fn add_identity_with_keychain(&self, spec: IdentitySpec) -> Result<Arc<Identity>> {
        if let Some(name) = spec.lookup_name()
            && let Some(existing) = self.identity(&name)
        {
            debug!("Identity {} already present", name);
            return Ok(existing);
        }

        let identity = spec.build().await?;
        if identity.is_encrypted() {
            identity.passphrase(self.resolver.as_ref()).await?;
        }
        Ok(self.insert(identity))
    }

    fn insert(&self, identity: Identity) -> Arc<Identity> {
        let identity = Arc::new(identity);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        self.identities
            .entry(identity.name.clone())
            .and_modify(|(_, existing)| *existing = identity.clone())
            .or_insert((seq, identity.clone()));

        info!("Added identity {}", identity.name);
        identity
    }

    pub fn has_identity(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    pub fn identity(&self, name: &str) -> Option<Arc<Identity>> {
        self.identities.get(name).map(|entry| entry.value().1.clone())
    }

    /// Identities in the order they were first added.
    pub fn identities(&self) -> Vec<Arc<Identity>> {
        let mut entries: Vec<(u64, Arc<Identity>)> = self
            .identities
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, identity)| identity).collect()
    }

    pub fn identity_names(&self) -> Vec<String> {
        self.identities()
            .iter()
            .map(|identity| identity.name.clone())
            .collect()
    }

    pub fn remove_identity(&self, name: &str) -> bool {
        self.identities.remove(name).is_some()
    }

    pub fn clear(&self) {
        self.identities.clear();
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
