//! Pluggable authentication backends.
//!
//! Backends are a capability set, not a hierarchy: each advertises which
//! credential shapes it accepts through [`BackendInfo`] and the pipeline
//! dispatches tagged [`Credentials`] variants at it. A backend needing more
//! than one round-trip returns [`AuthOutcome::Continue`] with a challenge;
//! its inter-step state lives in the session's challenge table, never in the
//! backend itself.

pub mod cert_reauth;
pub mod ldap;
pub mod oidc;
pub mod password;
pub mod pipeline;
pub mod pubkey;

pub use cert_reauth::CertReauthBackend;
pub use ldap::{LdapBackend, LdapSettings};
pub use oidc::{OidcBackend, OidcSettings};
pub use password::PasswordBackend;
pub use pipeline::{AuthPipeline, AuthenticatorDescription, PipelineEntry, PipelineError, StepResult};
pub use pubkey::PubkeyChallengeBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::{AuthContext, Identity};

/// Static description of a configured backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub backend: &'static str,
    pub interactive: bool,
    pub supports_key: bool,
    pub supports_password: bool,
    pub supports_federated: bool,
}

/// Tagged credential shapes. The HTTP boundary maps the flat request body
/// onto one of these before handing it to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    Password { username: String, password: String },
    /// sshsig signature (PEM) over `session_id || nonce || audience`.
    Signature { signature: String },
    /// OIDC authorisation code returned by the provider redirect.
    AuthCode { code: String },
    /// A still-valid certificate previously issued by this CA.
    Certificate { certificate: String },
    /// No credentials yet: ask the backend to open its challenge.
    Begin,
}

/// Challenge sent back to the client when a backend needs another round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Challenge {
    /// Sign `session_id || nonce || audience` with a trusted key.
    Nonce { nonce: String, audience: String },
    /// Visit the URL, authenticate with the provider, post back the code.
    Redirect { url: String, state: String },
}

#[derive(Debug)]
pub enum AuthOutcome {
    Complete(Identity),
    Continue(Challenge),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("bad credentials")]
    BadCredentials,
    #[error("account locked")]
    Locked,
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("denied by policy: {0}")]
    PolicyDenied(String),
    #[error("authentication timed out")]
    Timeout,
}

/// One configured authentication backend.
///
/// `authenticate` runs under the per-session lock; the context is writable so
/// a backend can stash or consume challenge state keyed by its own id.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    fn info(&self) -> BackendInfo;

    async fn authenticate(
        &self,
        ctx: &mut AuthContext,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, AuthError>;
}
