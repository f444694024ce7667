//! The signing state machine: turns a Ready session plus a certificate
//! request into a signed certificate, enforcing realm policy on the way.
//! A session signs at most once; repeated requests return the recorded
//! certificate until the session expires.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::AuthPipeline;
use crate::config::RealmConfig;
use crate::error::{ApiError, ApiResult};
use crate::globpat::PrincipalPattern;
use crate::identity::{merge_identities, AuthContext, MergeError, SessionState};
use crate::signer::{CertTemplate, SignerBackend, SignerError};

/// Clock skew subtracted from the validity start.
pub const SKEW_SECS: i64 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignRequest {
    /// Requested certificate lifetime in seconds; clamped to realm bounds,
    /// maximum when unset.
    pub lifetime_secs: Option<i64>,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedCertificate {
    pub certificate: String,
    pub key_id: String,
    pub valid_after: i64,
    pub valid_before: i64,
    pub principals: Vec<String>,
}

fn clamp_lifetime(requested: Option<i64>, realm: &RealmConfig) -> i64 {
    match requested {
        None => realm.max_lifetime_secs,
        Some(secs) => secs.clamp(realm.min_lifetime_secs, realm.max_lifetime_secs),
    }
}

fn compile_pattern(source: &Option<String>, which: &str) -> ApiResult<Option<PrincipalPattern>> {
    match source.as_deref().filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(src) => PrincipalPattern::new(src)
            .map(Some)
            .map_err(|e| ApiError::bad_request(format!("{} pattern: {}", which, e))),
    }
}

fn signed_output(ctx: &AuthContext) -> ApiResult<SignedCertificate> {
    let cert = ctx
        .certificate
        .as_ref()
        .ok_or_else(|| ApiError::internal("signed session without certificate"))?;
    Ok(SignedCertificate {
        certificate: cert
            .to_openssh()
            .map_err(|e| ApiError::internal(format!("certificate encoding: {}", e)))?,
        key_id: cert.key_id().to_string(),
        valid_after: cert.valid_after() as i64,
        valid_before: cert.valid_before() as i64,
        principals: cert.valid_principals().to_vec(),
    })
}

/// Run the sign step for one session. The caller holds the session lock.
pub async fn get_cert(
    ctx: &mut AuthContext,
    pipeline: &AuthPipeline,
    realm: &RealmConfig,
    signer: &dyn SignerBackend,
    request: &SignRequest,
) -> ApiResult<SignedCertificate> {
    // Idempotency: once signed, the recorded certificate is the answer.
    if ctx.certificate.is_some() {
        return signed_output(ctx);
    }
    match ctx.state() {
        SessionState::Ready => {}
        SessionState::Ended => return Err(ApiError::unauthenticated("session expired")),
        _ => {
            return Err(ApiError::not_ready(format!(
                "authenticators outstanding: {}",
                ctx.pending.iter().cloned().collect::<Vec<_>>().join(", ")
            )))
        }
    }
    let pubkey = ctx
        .pubkey
        .clone()
        .ok_or_else(|| ApiError::internal("ready session without public key"))?;

    let include = compile_pattern(&request.include, "include")?;
    let exclude = compile_pattern(&request.exclude, "exclude")?;
    let effective =
        merge_identities(&ctx.identities, pipeline.merge_policy(), include.as_ref(), exclude.as_ref())
            .map_err(|e| match e {
                MergeError::NoEligiblePrincipals => {
                    ApiError::policy_denied("no eligible principals")
                }
                MergeError::NoIdentities => ApiError::internal("ready session without identities"),
            })?;

    let lifetime = clamp_lifetime(request.lifetime_secs, realm);
    let now = Utc::now().timestamp();
    let valid_after = (now - SKEW_SECS).max(0) as u64;
    let valid_before = (now + lifetime) as u64;

    let mut critical_options = Vec::new();
    if let Some(cmd) = &realm.force_command {
        critical_options.push(("force-command".to_string(), cmd.clone()));
    }
    if let Some(addr) = &realm.source_address {
        critical_options.push(("source-address".to_string(), addr.clone()));
    }
    let extensions: Vec<(String, String)> =
        realm.extensions.iter().map(|e| (e.clone(), String::new())).collect();

    let mut serial_bytes = [0u8; 8];
    getrandom::getrandom(&mut serial_bytes).expect("system rng");

    let key_id = format!("{}@{}", effective.key_id, realm.name);
    let template = CertTemplate {
        public_key: pubkey,
        key_id: key_id.clone(),
        principals: effective.principals.iter().cloned().collect(),
        valid_after,
        valid_before,
        serial: u64::from_be_bytes(serial_bytes),
        critical_options,
        extensions,
        comment: key_id.clone(),
    };

    let certificate = signer.sign(&template).await.map_err(|e| match e {
        SignerError::Sealed => ApiError::signer_sealed("no key material available"),
        SignerError::Unavailable(detail) => ApiError::upstream(detail),
        SignerError::Rejected(detail) => ApiError::internal(format!("template rejected: {}", detail)),
        SignerError::BadSecret => ApiError::internal("unexpected unseal failure during sign"),
    })?;

    info!(
        session = %ctx.id,
        key_id = %key_id,
        principals = template.principals.len(),
        lifetime_secs = lifetime,
        "certificate issued"
    );
    // Recorded even if the caller has gone away, so a retried get_cert
    // returns the same bytes.
    ctx.certificate = Some(certificate);
    signed_output(ctx)
}

/// Human-readable validity timestamps for API responses.
pub fn rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm(min: i64, max: i64) -> RealmConfig {
        RealmConfig { min_lifetime_secs: min, max_lifetime_secs: max, ..Default::default() }
    }

    #[test]
    fn lifetime_defaults_to_max() {
        assert_eq!(clamp_lifetime(None, &realm(60, 600)), 600);
    }

    #[test]
    fn lifetime_clamps_both_ends() {
        assert_eq!(clamp_lifetime(Some(1), &realm(60, 600)), 60);
        assert_eq!(clamp_lifetime(Some(6000), &realm(60, 600)), 600);
        assert_eq!(clamp_lifetime(Some(300), &realm(60, 600)), 300);
    }

    #[test]
    fn bad_glob_is_a_bad_request() {
        let err = compile_pattern(&Some("{a,b".to_string()), "include").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest { .. }));
        assert!(compile_pattern(&Some(String::new()), "include").unwrap().is_none());
        assert!(compile_pattern(&None, "include").unwrap().is_none());
    }
}
