//! In-process signer: holds a decrypted CA private key.
//!
//! The key is loaded from an OpenSSH private key file at boot. An encrypted
//! key without a passphrase leaves the signer sealed until an administrative
//! unseal supplies one; sealing again discards the decrypted copy and keeps
//! only the encrypted original.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use ssh_key::certificate::{Builder, CertType};
use ssh_key::rand_core::OsRng;
use ssh_key::{Certificate, PrivateKey};
use tracing::info;

use async_trait::async_trait;

use super::{CertTemplate, SignerBackend, SignerError};

/// Build and sign a certificate from a template with an in-process key.
/// Critical options and extensions are encoded in name order.
pub fn build_certificate(
    template: &CertTemplate,
    ca_key: &PrivateKey,
) -> Result<Certificate, SignerError> {
    if template.principals.is_empty() {
        return Err(SignerError::Rejected("no principals".into()));
    }
    if template.valid_before <= template.valid_after {
        return Err(SignerError::Rejected("empty validity window".into()));
    }
    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        template.public_key.key_data().clone(),
        template.valid_after,
        template.valid_before,
    )
    .map_err(|e| SignerError::Rejected(e.to_string()))?;
    builder.serial(template.serial).map_err(|e| SignerError::Rejected(e.to_string()))?;
    builder.key_id(&template.key_id).map_err(|e| SignerError::Rejected(e.to_string()))?;
    builder.cert_type(CertType::User).map_err(|e| SignerError::Rejected(e.to_string()))?;
    for principal in &template.principals {
        builder
            .valid_principal(principal.clone())
            .map_err(|e| SignerError::Rejected(e.to_string()))?;
    }
    let mut critical = template.critical_options.clone();
    critical.sort();
    for (name, value) in &critical {
        builder
            .critical_option(name.clone(), value.clone())
            .map_err(|e| SignerError::Rejected(e.to_string()))?;
    }
    let mut extensions = template.extensions.clone();
    extensions.sort();
    for (name, value) in &extensions {
        builder
            .extension(name.clone(), value.clone())
            .map_err(|e| SignerError::Rejected(e.to_string()))?;
    }
    if !template.comment.is_empty() {
        builder.comment(&template.comment).map_err(|e| SignerError::Rejected(e.to_string()))?;
    }
    builder.sign(ca_key).map_err(|e| SignerError::Unavailable(e.to_string()))
}

enum KeyState {
    /// No usable key. The encrypted original is retained when there is one,
    /// so an unseal with the right passphrase can recover.
    Sealed { encrypted: Option<PrivateKey> },
    Unsealed { key: PrivateKey, encrypted: Option<PrivateKey> },
}

pub struct LocalSigner {
    id: String,
    state: RwLock<KeyState>,
}

impl LocalSigner {
    /// Load from an OpenSSH private key file. With `passphrase` set an
    /// encrypted key is decrypted immediately; without one the signer starts
    /// sealed.
    pub fn from_file<P: AsRef<Path>>(id: &str, path: P, passphrase: Option<&str>) -> Result<Self> {
        let pem = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading CA key {}", path.as_ref().display()))?;
        let key = PrivateKey::from_openssh(&pem)
            .with_context(|| format!("parsing CA key {}", path.as_ref().display()))?;
        let state = if key.is_encrypted() {
            match passphrase {
                Some(secret) => {
                    let decrypted = key
                        .decrypt(secret.as_bytes())
                        .context("decrypting CA key with configured passphrase")?;
                    info!(signer = id, "CA key decrypted at boot");
                    KeyState::Unsealed { key: decrypted, encrypted: Some(key) }
                }
                None => {
                    info!(signer = id, "CA key is encrypted; signer starts sealed");
                    KeyState::Sealed { encrypted: Some(key) }
                }
            }
        } else {
            KeyState::Unsealed { key, encrypted: None }
        };
        Ok(Self { id: id.to_string(), state: RwLock::new(state) })
    }

    /// Wrap an already-decrypted key; used by tests and the signing daemon.
    pub fn from_key(id: &str, key: PrivateKey) -> Self {
        Self {
            id: id.to_string(),
            state: RwLock::new(KeyState::Unsealed { key, encrypted: None }),
        }
    }

    pub fn public_key(&self) -> Option<ssh_key::PublicKey> {
        match &*self.state.read() {
            KeyState::Unsealed { key, .. } => Some(key.public_key().clone()),
            KeyState::Sealed { encrypted } => {
                encrypted.as_ref().map(|k| k.public_key().clone())
            }
        }
    }
}

#[async_trait]
impl SignerBackend for LocalSigner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn sign(&self, template: &CertTemplate) -> Result<Certificate, SignerError> {
        // Clone the key out so the lock is not held across the signing math.
        let key = match &*self.state.read() {
            KeyState::Unsealed { key, .. } => key.clone(),
            KeyState::Sealed { .. } => return Err(SignerError::Sealed),
        };
        build_certificate(template, &key)
    }

    async fn unseal(&self, secret: &str) -> Result<(), SignerError> {
        let mut state = self.state.write();
        match &*state {
            KeyState::Unsealed { .. } => Ok(()),
            KeyState::Sealed { encrypted: Some(enc) } => {
                let decrypted = enc.decrypt(secret.as_bytes()).map_err(|_| SignerError::BadSecret)?;
                info!(signer = %self.id, "signer unsealed");
                *state = KeyState::Unsealed { key: decrypted, encrypted: Some(enc.clone()) };
                Ok(())
            }
            KeyState::Sealed { encrypted: None } => {
                Err(SignerError::Unavailable("no key material to unseal".into()))
            }
        }
    }

    async fn seal(&self) {
        let mut state = self.state.write();
        let encrypted = match &*state {
            KeyState::Unsealed { encrypted, .. } => encrypted.clone(),
            KeyState::Sealed { encrypted } => encrypted.clone(),
        };
        info!(signer = %self.id, "signer sealed");
        *state = KeyState::Sealed { encrypted };
    }

    fn is_sealed(&self) -> bool {
        matches!(&*self.state.read(), KeyState::Sealed { .. })
    }
}
