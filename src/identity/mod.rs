//! Identities, the identity store and key generation.
//!
//! An [`Identity`] is a private key (plus optional public half) that the
//! authentication chain can offer to a server. Identities live in an
//! [`IdentityStore`], which plays the role of an in-process agent: it is shared
//! through the [`SshContext`](crate::context::SshContext) and asked for keys,
//! in insertion order, whenever a session authenticates.
//!
//! Encrypted keys are detected once, when the identity is built. Their
//! passphrase is resolved lazily, at most once, through a
//! [`PassphraseResolver`].

mod keygen;
mod passphrase;
mod store;

use std::fmt;
use std::path::{Path, PathBuf};

use russh::keys::{self, PrivateKey};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{Error, Result};

pub use keygen::{DEFAULT_RSA_BITS, KeyPair, KeyType, generate_keypair, write_keypair};
pub use passphrase::{
    EnvPassphrase, NoPassphrase, PASSPHRASE_ENV_VAR, PassphraseResolver, ResolverChain,
    StaticPassphrase,
};
pub use store::{IdentitySpec, IdentityStore};

/// A private key available for public-key authentication.
pub struct Identity {
    name: String,
    private_key: Vec<u8>,
    public_key: Option<Vec<u8>>,
    path: Option<PathBuf>,
    encrypted: bool,
    passphrase: OnceCell<Option<String>>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("encrypted", &self.encrypted)
            .field("has_public_key", &self.public_key.is_some())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Build an identity from raw key bytes.
    ///
    /// # Arguments
    ///
    /// * `name` - Name the identity is stored under
    /// * `private_key` - Private key text (OpenSSH or PEM)
    /// * `public_key` - Optional public key line
    /// * `passphrase` - Known passphrase; skips the resolver when present
    pub fn from_bytes(
        name: impl Into<String>,
        private_key: impl Into<Vec<u8>>,
        public_key: Option<Vec<u8>>,
        passphrase: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        let private_key = private_key.into();
        let encrypted = detect_encrypted(&name, &private_key)?;

        debug!("Loaded identity {} (encrypted: {})", name, encrypted);

        Ok(Self {
            name,
            private_key,
            public_key,
            path: None,
            encrypted,
            passphrase: OnceCell::new_with(passphrase.map(Some)),
        })
    }

    /// Load an identity from a private key file and an optional public key file.
    ///
    /// The identity is named after the private key path.
    pub async fn from_paths(
        private_path: impl AsRef<Path>,
        public_path: Option<&Path>,
        passphrase: Option<String>,
    ) -> Result<Self> {
        let private_path = private_path.as_ref();
        let private_key = tokio::fs::read(private_path).await?;
        let public_key = match public_path {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };

        let mut identity = Self::from_bytes(
            private_path.display().to_string(),
            private_key,
            public_key,
            passphrase,
        )?;
        identity.path = Some(private_path.to_path_buf());
        Ok(identity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn public_key(&self) -> Option<&[u8]> {
        self.public_key.as_deref()
    }

    /// Whether the private key needs a passphrase. Fixed at construction.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Passphrase for this identity, asking `resolver` at most once.
    ///
    /// Unencrypted identities resolve to `None`. An encrypted identity for
    /// which the resolver had nothing fails with
    /// [`Error::PassphraseNotFound`] now and on every later call.
    pub async fn passphrase(&self, resolver: &dyn PassphraseResolver) -> Result<Option<&str>> {
        if !self.encrypted {
            return Ok(None);
        }

        let cached = self
            .passphrase
            .get_or_init(|| async {
                debug!(
                    "Resolving passphrase for {} via {} resolver",
                    self.name,
                    resolver.name()
                );
                resolver.resolve(&self.name).await
            })
            .await;

        match cached {
            Some(passphrase) => Ok(Some(passphrase.as_str())),
            None => Err(Error::PassphraseNotFound {
                identity: self.name.clone(),
            }),
        }
    }

    /// Decode the private key, decrypting it if needed.
    pub async fn decode(&self, resolver: &dyn PassphraseResolver) -> Result<PrivateKey> {
        let passphrase = self.passphrase(resolver).await?;
        let text = key_text(&self.name, &self.private_key)?;
        Ok(keys::decode_secret_key(text, passphrase)?)
    }
}

fn key_text<'a>(name: &str, private_key: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(private_key).map_err(|_| {
        Error::UnknownIdentityConstruction(format!("private key for {name} is not text"))
    })
}

/// Detect whether a private key is passphrase protected.
fn detect_encrypted(name: &str, private_key: &[u8]) -> Result<bool> {
    let text = key_text(name, private_key)?;

    if text.contains("BEGIN OPENSSH PRIVATE KEY") {
        let key = ssh_key::PrivateKey::from_openssh(text).map_err(|e| {
            Error::UnknownIdentityConstruction(format!("invalid private key for {name}: {e}"))
        })?;
        return Ok(key.is_encrypted());
    }

    if text.contains("-----BEGIN") {
        return Ok(text.contains("ENCRYPTED"));
    }

    Err(Error::UnknownIdentityConstruction(format!(
        "{name} does not contain a PEM or OpenSSH private key"
    )))
}
