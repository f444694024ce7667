//! Public-key challenge/response authentication.
//!
//! First round-trip issues a random 32-byte nonce bound to the session id;
//! the client answers with an `sshsig` signature over
//! `session_id || nonce || audience` made by one of the configured trust
//! roots. Nonces are single-use: the stored challenge is consumed on the
//! first verification attempt, successful or not.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ssh_key::{HashAlg, PublicKey, SshSig};
use tracing::{debug, warn};

use async_trait::async_trait;

use super::{AuthBackend, AuthError, AuthOutcome, BackendInfo, Challenge, Credentials};
use crate::identity::{AuthContext, Identity, PendingChallengeState};

/// sshsig namespace for challenge signatures.
pub const SIG_NAMESPACE: &str = "inscribe-auth";

/// Challenges older than this are void.
const NONCE_TTL_SECS: i64 = 120;

/// Parse authorized-keys style trust-root lines. Invalid lines are logged
/// and skipped.
pub fn parse_trust_roots(lines: &[String]) -> Vec<PublicKey> {
    lines
        .iter()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            match PublicKey::from_openssh(line) {
                Ok(key) => {
                    debug!(
                        fingerprint = %key.fingerprint(HashAlg::Sha256),
                        algorithm = %key.algorithm(),
                        "loaded trust root"
                    );
                    Some(key)
                }
                Err(e) => {
                    warn!(error = %e, "skipping unparseable trust root");
                    None
                }
            }
        })
        .collect()
}

pub struct PubkeyChallengeBackend {
    id: String,
    name: String,
    audience: String,
    trust_roots: Vec<PublicKey>,
    /// Principal templates; `{subject}` expands to the matched key's subject.
    principal_templates: Vec<String>,
}

impl PubkeyChallengeBackend {
    pub fn new(
        id: &str,
        name: &str,
        audience: &str,
        trust_roots: Vec<PublicKey>,
        principal_templates: Vec<String>,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            audience: audience.to_string(),
            trust_roots,
            principal_templates,
        }
    }

    /// The bytes a client must sign for the given session and nonce.
    pub fn challenge_message(session_id: &str, nonce: &[u8], audience: &str) -> Vec<u8> {
        let mut msg = Vec::with_capacity(session_id.len() + nonce.len() + audience.len());
        msg.extend_from_slice(session_id.as_bytes());
        msg.extend_from_slice(nonce);
        msg.extend_from_slice(audience.as_bytes());
        msg
    }

    fn subject_for(key: &PublicKey) -> String {
        let comment = key.comment();
        if comment.is_empty() {
            key.fingerprint(HashAlg::Sha256).to_string()
        } else {
            comment.to_string()
        }
    }

    fn principals_for(&self, subject: &str) -> Vec<String> {
        if self.principal_templates.is_empty() {
            return vec![subject.to_string()];
        }
        self.principal_templates.iter().map(|t| t.replace("{subject}", subject)).collect()
    }

    fn open_challenge(&self, ctx: &mut AuthContext) -> Challenge {
        let mut nonce = [0u8; 32];
        getrandom::getrandom(&mut nonce).expect("system rng");
        ctx.challenges.insert(
            self.id.clone(),
            PendingChallengeState {
                nonce: nonce.to_vec(),
                data: Default::default(),
                issued_at: Some(Utc::now()),
            },
        );
        Challenge::Nonce { nonce: URL_SAFE_NO_PAD.encode(nonce), audience: self.audience.clone() }
    }
}

#[async_trait]
impl AuthBackend for PubkeyChallengeBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            backend: "pubkey",
            interactive: false,
            supports_key: true,
            supports_password: false,
            supports_federated: false,
        }
    }

    async fn authenticate(
        &self,
        ctx: &mut AuthContext,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, AuthError> {
        match credentials {
            Credentials::Begin => Ok(AuthOutcome::Continue(self.open_challenge(ctx))),
            Credentials::Signature { signature } => {
                // Consume the nonce up front: one verification attempt each.
                let Some(state) = ctx.challenges.remove(&self.id) else {
                    return Err(AuthError::BadCredentials);
                };
                let fresh = state
                    .issued_at
                    .map(|at| Utc::now() < at + chrono::Duration::seconds(NONCE_TTL_SECS))
                    .unwrap_or(false);
                if !fresh {
                    return Err(AuthError::BadCredentials);
                }
                let sig = SshSig::from_pem(signature.as_bytes())
                    .map_err(|_| AuthError::BadCredentials)?;
                let msg = Self::challenge_message(&ctx.id, &state.nonce, &self.audience);
                let signer = self
                    .trust_roots
                    .iter()
                    .find(|key| key.verify(SIG_NAMESPACE, &msg, &sig).is_ok());
                let Some(key) = signer else {
                    return Err(AuthError::BadCredentials);
                };
                let subject = Self::subject_for(key);
                let identity = Identity::new(subject.clone(), self.id.clone())
                    .with_principals(self.principals_for(&subject))
                    .with_claim("fingerprint", key.fingerprint(HashAlg::Sha256).to_string());
                Ok(AuthOutcome::Complete(identity))
            }
            _ => Err(AuthError::BadCredentials),
        }
    }
}
