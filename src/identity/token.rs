//! Stateless session tokens.
//!
//! A token is `base64url(payload) "." base64url(mac)` where the payload is
//! the canonical JSON of `{sid, iat, exp, aud}` and the MAC is HMAC-SHA256
//! under a process-wide key drawn at startup. Tokens carry no principal
//! information; the server always resolves identity through the session
//! store. Verification is constant-time in the MAC comparison.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Tolerated clock skew when checking `iat`/`exp`.
pub const SKEW_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("audience mismatch")]
    AudienceMismatch,
}

/// Process-wide MAC key. Deliberately ephemeral: a restart invalidates every
/// outstanding token, which matches the in-memory session store.
#[derive(Clone)]
pub struct TokenKey {
    secret: [u8; 32],
}

impl TokenKey {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret).expect("system rng");
        Self { secret }
    }

    /// Fixed key for tests; never use outside test setups.
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    pub fn issue(&self, sid: &str, audience: &str, expires_at: DateTime<Utc>) -> String {
        let payload = TokenPayload {
            sid: sid.to_string(),
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
            aud: audience.to_string(),
        };
        self.encode(&payload)
    }

    pub fn encode(&self, payload: &TokenPayload) -> String {
        let body = serde_json::to_vec(payload).expect("payload serialises");
        let mac = self.mac(&body);
        format!("{}.{}", URL_SAFE_NO_PAD.encode(&body), URL_SAFE_NO_PAD.encode(mac))
    }

    /// Verify MAC, validity window and audience; returns the embedded payload.
    pub fn verify(&self, token: &str, audience: &str) -> Result<TokenPayload, TokenError> {
        let (body_b64, mac_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let body = URL_SAFE_NO_PAD.decode(body_b64).map_err(|_| TokenError::Malformed)?;
        let mac = URL_SAFE_NO_PAD.decode(mac_b64).map_err(|_| TokenError::Malformed)?;

        let mut verifier = Hmac::<Sha256>::new_from_slice(&self.secret).expect("hmac key");
        verifier.update(&body);
        verifier.verify_slice(&mac).map_err(|_| TokenError::InvalidSignature)?;

        let payload: TokenPayload =
            serde_json::from_slice(&body).map_err(|_| TokenError::Malformed)?;
        let now = Utc::now().timestamp();
        if payload.exp + SKEW_SECS < now {
            return Err(TokenError::Expired);
        }
        if payload.iat - SKEW_SECS > now {
            return Err(TokenError::NotYetValid);
        }
        if payload.aud != audience {
            return Err(TokenError::AudienceMismatch);
        }
        Ok(payload)
    }

    fn mac(&self, message: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).expect("hmac key");
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Convenience for building an expiry from now.
pub fn expiry_in(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp() + secs, 0).unwrap()
}
