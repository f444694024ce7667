//! CA key custody.
//!
//! A signer backend turns a certificate template into a signed OpenSSH user
//! certificate. Key material never leaves the backend: the in-process signer
//! holds a decrypted private key, the agent signer leaves the key inside an
//! SSH agent, the remote signer leaves it on another host entirely.
//!
//! Concurrent sign requests against one signer are serialised with a FIFO
//! lock inside [`SerializedSigner`]; callers never add their own locking.

mod agent;
mod local;
mod remote;

pub use agent::AgentSigner;
pub use local::{build_certificate, LocalSigner};
pub use remote::RemoteSigner;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ssh_key::Certificate;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signer is sealed")]
    Sealed,
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    #[error("template rejected: {0}")]
    Rejected(String),
    #[error("bad unseal secret")]
    BadSecret,
}

/// Everything needed to mint one user certificate.
#[derive(Debug, Clone)]
pub struct CertTemplate {
    pub public_key: ssh_key::PublicKey,
    pub key_id: String,
    pub principals: Vec<String>,
    pub valid_after: u64,
    pub valid_before: u64,
    pub serial: u64,
    /// Sorted by name before encoding, as the certificate format requires.
    pub critical_options: Vec<(String, String)>,
    pub extensions: Vec<(String, String)>,
    pub comment: String,
}

/// JSON form of a template, used by the remote signing daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTemplate {
    pub public_key: String,
    pub key_id: String,
    pub principals: Vec<String>,
    pub valid_after: u64,
    pub valid_before: u64,
    pub serial: u64,
    pub critical_options: Vec<(String, String)>,
    pub extensions: Vec<(String, String)>,
    pub comment: String,
}

impl CertTemplate {
    pub fn to_wire(&self) -> WireTemplate {
        WireTemplate {
            public_key: self.public_key.to_openssh().unwrap_or_default(),
            key_id: self.key_id.clone(),
            principals: self.principals.clone(),
            valid_after: self.valid_after,
            valid_before: self.valid_before,
            serial: self.serial,
            critical_options: self.critical_options.clone(),
            extensions: self.extensions.clone(),
            comment: self.comment.clone(),
        }
    }

    pub fn from_wire(wire: &WireTemplate) -> Result<Self, SignerError> {
        let public_key = ssh_key::PublicKey::from_openssh(&wire.public_key)
            .map_err(|e| SignerError::Rejected(format!("bad public key: {}", e)))?;
        Ok(Self {
            public_key,
            key_id: wire.key_id.clone(),
            principals: wire.principals.clone(),
            valid_after: wire.valid_after,
            valid_before: wire.valid_before,
            serial: wire.serial,
            critical_options: wire.critical_options.clone(),
            extensions: wire.extensions.clone(),
            comment: wire.comment.clone(),
        })
    }
}

#[async_trait]
pub trait SignerBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn sign(&self, template: &CertTemplate) -> Result<Certificate, SignerError>;

    /// Move from sealed to unsealed with the given secret.
    async fn unseal(&self, secret: &str) -> Result<(), SignerError>;

    /// Discard decrypted key material.
    async fn seal(&self);

    fn is_sealed(&self) -> bool;
}

/// FIFO serialisation around a signer. `tokio::sync::Mutex` queues waiters
/// fairly, so requests complete in arrival order. The concurrency counters
/// exist so tests can assert the single-flight property.
pub struct SerializedSigner {
    inner: Arc<dyn SignerBackend>,
    gate: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SerializedSigner {
    pub fn new(inner: Arc<dyn SignerBackend>) -> Self {
        Self {
            inner,
            gate: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Highest number of sign calls ever observed inside the gate.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignerBackend for SerializedSigner {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn sign(&self, template: &CertTemplate) -> Result<Certificate, SignerError> {
        let _guard = self.gate.lock().await;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.sign(template).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn unseal(&self, secret: &str) -> Result<(), SignerError> {
        let _guard = self.gate.lock().await;
        self.inner.unseal(secret).await
    }

    async fn seal(&self) {
        let _guard = self.gate.lock().await;
        self.inner.seal().await
    }

    fn is_sealed(&self) -> bool {
        self.inner.is_sealed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, PrivateKey};

    fn template() -> CertTemplate {
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        CertTemplate {
            public_key: subject.public_key().clone(),
            key_id: "alice/pw".into(),
            principals: vec!["alice".into()],
            valid_after: 0,
            valid_before: u64::MAX - 1,
            serial: 1,
            critical_options: vec![],
            extensions: vec![("permit-pty".into(), String::new())],
            comment: "alice".into(),
        }
    }

    #[test]
    fn wire_round_trip() {
        let t = template();
        let wire = t.to_wire();
        let back = CertTemplate::from_wire(&wire).unwrap();
        assert_eq!(back.key_id, t.key_id);
        assert_eq!(back.principals, t.principals);
        assert_eq!(back.public_key, t.public_key);
        assert_eq!(back.extensions, t.extensions);
    }

    #[test]
    fn wire_rejects_bad_key() {
        let mut wire = template().to_wire();
        wire.public_key = "garbage".into();
        assert!(matches!(CertTemplate::from_wire(&wire), Err(SignerError::Rejected(_))));
    }

    #[tokio::test]
    async fn serialized_signer_single_flight() {
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let signer = Arc::new(SerializedSigner::new(Arc::new(LocalSigner::from_key(
            "test",
            ca,
        ))));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&signer);
            let t = template();
            handles.push(tokio::spawn(async move { s.sign(&t).await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(signer.peak_concurrency(), 1);
    }
}
