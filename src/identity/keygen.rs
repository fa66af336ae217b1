//! Keypair generation and serialization.
//!
//! Keys are produced by `ssh-key` and serialized in OpenSSH format. An
//! optional passphrase encrypts the private key with the OpenSSH bcrypt KDF.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ssh_key::private::{DsaKeypair, Ed25519Keypair, KeypairData, RsaKeypair};
use ssh_key::rand_core::OsRng;
use ssh_key::{HashAlg, LineEnding, PrivateKey};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default RSA modulus size in bits
pub const DEFAULT_RSA_BITS: usize = 3072;

/// Smallest RSA modulus accepted
pub const MIN_RSA_BITS: usize = 2048;

/// The only DSA size OpenSSH accepts
pub const DSA_BITS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Dsa,
    Ed25519,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "rsa"),
            KeyType::Dsa => write!(f, "dsa"),
            KeyType::Ed25519 => write!(f, "ed25519"),
        }
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyType::Rsa),
            "dsa" | "dss" => Ok(KeyType::Dsa),
            "ed25519" => Ok(KeyType::Ed25519),
            other => Err(Error::KeyGeneration(format!("unsupported key type: {other}"))),
        }
    }
}

/// Generated key material in OpenSSH encoding.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub key_type: KeyType,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
    /// SHA-256 fingerprint, `SHA256:<base64>`
    pub fingerprint: String,
    pub encrypted: bool,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_type", &self.key_type)
            .field("fingerprint", &self.fingerprint)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

/// Generate a new keypair.
///
/// # Arguments
///
/// * `key_type` - Algorithm to generate
/// * `bits` - Key size; only meaningful for RSA (defaults to 3072). DSA is
///   always 1024 bits and Ed25519 has a fixed size.
/// * `passphrase` - Encrypts the private key when present and non-empty
/// * `comment` - Comment stored in both halves of the key
pub fn generate_keypair(
    key_type: KeyType,
    bits: Option<usize>,
    passphrase: Option<&str>,
    comment: &str,
) -> Result<KeyPair> {
    let key_data = match key_type {
        KeyType::Rsa => {
            let bits = bits.unwrap_or(DEFAULT_RSA_BITS);
            if bits < MIN_RSA_BITS {
                return Err(Error::KeyGeneration(format!(
                    "RSA keys must be at least {MIN_RSA_BITS} bits, got {bits}"
                )));
            }
            let keypair = RsaKeypair::random(&mut OsRng, bits).map_err(key_error)?;
            KeypairData::from(keypair)
        }
        KeyType::Dsa => {
            if let Some(bits) = bits
                && bits != DSA_BITS
            {
                return Err(Error::KeyGeneration(format!(
                    "DSA keys must be {DSA_BITS} bits, got {bits}"
                )));
            }
            let keypair = DsaKeypair::random(&mut OsRng).map_err(key_error)?;
            KeypairData::from(keypair)
        }
        KeyType::Ed25519 => KeypairData::from(Ed25519Keypair::random(&mut OsRng)),
    };

    let mut private_key = PrivateKey::new(key_data, comment).map_err(key_error)?;
    let fingerprint = private_key.fingerprint(HashAlg::Sha256).to_string();
    let public_key = private_key.public_key().to_openssh().map_err(key_error)?;

    let encrypted = match passphrase.filter(|p| !p.is_empty()) {
        Some(passphrase) => {
            private_key = private_key
                .encrypt(&mut OsRng, passphrase)
                .map_err(key_error)?;
            true
        }
        None => false,
    };
    let private_text = private_key.to_openssh(LineEnding::LF).map_err(key_error)?;

    info!("Generated {} keypair {}", key_type, fingerprint);

    Ok(KeyPair {
        key_type,
        private_key: private_text.as_bytes().to_vec(),
        public_key: format!("{public_key}\n").into_bytes(),
        fingerprint,
        encrypted,
    })
}

/// Write both halves of a keypair. The private key file is restricted to the
/// owner on Unix.
pub async fn write_keypair(
    keypair: &KeyPair,
    private_path: impl AsRef<Path>,
    public_path: impl AsRef<Path>,
) -> Result<()> {
    let private_path = private_path.as_ref();
    let public_path = public_path.as_ref();

    tokio::fs::write(private_path, &keypair.private_key).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(private_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::write(public_path, &keypair.public_key).await?;

    debug!(
        "Wrote keypair to {} and {}",
        private_path.display(),
        public_path.display()
    );
    Ok(())
}

fn key_error(err: ssh_key::Error) -> Error {
    Error::KeyGeneration(err.to_string())
}
