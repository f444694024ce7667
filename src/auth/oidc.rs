//! OIDC authentication via the authorisation-code flow.
//!
//! The first step hands the client a provider redirect URL carrying a
//! session-bound `state`. After the user authenticates, the client posts the
//! authorisation code back; the backend exchanges it at the token endpoint,
//! verifies the ID token against the provider JWKS (RS256) and projects
//! configured claims into principals.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use super::{AuthBackend, AuthError, AuthOutcome, BackendInfo, Challenge, Credentials};
use crate::identity::{AuthContext, Identity, PendingChallengeState};

/// How long discovery documents and JWKS responses are cached.
const CACHE_SECS: u64 = 3600;
/// Upstream HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps one ID-token claim into certificate principals. `{value}` in the
/// template expands to each value of the claim (arrays fan out).
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimMapping {
    pub claim: String,
    pub template: String,
}

#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Claim naming the subject; defaults to `sub`.
    pub subject_claim: String,
    pub principal_mappings: Vec<ClaimMapping>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

struct CachedDiscovery {
    document: Option<DiscoveryDocument>,
    fetched: Option<Instant>,
}

struct CachedJwks {
    keys: Option<JwksResponse>,
    fetched: Option<Instant>,
}

pub struct OidcBackend {
    id: String,
    name: String,
    settings: OidcSettings,
    http: reqwest::Client,
    discovery: RwLock<CachedDiscovery>,
    jwks: RwLock<CachedJwks>,
    /// Serialises cache refreshes so a burst of logins fetches once.
    refresh_lock: Mutex<()>,
}

impl OidcBackend {
    pub fn new(id: &str, name: &str, settings: OidcSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            id: id.to_string(),
            name: name.to_string(),
            settings,
            http,
            discovery: RwLock::new(CachedDiscovery { document: None, fetched: None }),
            jwks: RwLock::new(CachedJwks { keys: None, fetched: None }),
            refresh_lock: Mutex::new(()),
        }
    }

    async fn discovery(&self) -> Result<DiscoveryDocument, AuthError> {
        {
            let cache = self.discovery.read().await;
            if let (Some(doc), Some(at)) = (&cache.document, cache.fetched) {
                if at.elapsed() < Duration::from_secs(CACHE_SECS) {
                    return Ok(doc.clone());
                }
            }
        }
        let _guard = self.refresh_lock.lock().await;
        {
            let cache = self.discovery.read().await;
            if let (Some(doc), Some(at)) = (&cache.document, cache.fetched) {
                if at.elapsed() < Duration::from_secs(CACHE_SECS) {
                    return Ok(doc.clone());
                }
            }
        }
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.settings.issuer.trim_end_matches('/')
        );
        info!(authenticator = %self.id, url = %url, "fetching OIDC discovery document");
        let doc: DiscoveryDocument = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?;
        if doc.issuer.trim_end_matches('/') != self.settings.issuer.trim_end_matches('/') {
            warn!(
                authenticator = %self.id,
                advertised = %doc.issuer,
                "discovery document issuer differs from configuration"
            );
        }
        let mut cache = self.discovery.write().await;
        cache.document = Some(doc.clone());
        cache.fetched = Some(Instant::now());
        Ok(doc)
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let refresh_needed = {
            let cache = self.jwks.read().await;
            match cache.fetched {
                Some(at) => at.elapsed() > Duration::from_secs(CACHE_SECS),
                None => true,
            }
        };
        if refresh_needed {
            let _guard = self.refresh_lock.lock().await;
            let still_needed = {
                let cache = self.jwks.read().await;
                match cache.fetched {
                    Some(at) => at.elapsed() > Duration::from_secs(CACHE_SECS),
                    None => true,
                }
            };
            if still_needed {
                let doc = self.discovery().await?;
                let jwks: JwksResponse = self
                    .http
                    .get(&doc.jwks_uri)
                    .send()
                    .await
                    .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?
                    .json()
                    .await
                    .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?;
                info!(authenticator = %self.id, keys = jwks.keys.len(), "loaded provider JWKS");
                let mut cache = self.jwks.write().await;
                cache.keys = Some(jwks);
                cache.fetched = Some(Instant::now());
            }
        }
        let cache = self.jwks.read().await;
        let jwks = cache.keys.as_ref().ok_or_else(|| {
            AuthError::UpstreamUnavailable("provider JWKS not loaded".to_string())
        })?;
        let jwk = jwks
            .keys
            .iter()
            .find(|k| match (kid, k.kid.as_deref()) {
                (Some(want), Some(have)) => want == have,
                (None, _) => true,
                _ => false,
            })
            .ok_or(AuthError::BadCredentials)?;
        match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) => {
                DecodingKey::from_rsa_components(n, e).map_err(|_| AuthError::BadCredentials)
            }
            _ => Err(AuthError::BadCredentials),
        }
    }

    fn authorization_url(&self, doc: &DiscoveryDocument, state: &str) -> String {
        let scopes = if self.settings.scopes.is_empty() {
            "openid".to_string()
        } else {
            self.settings.scopes.join(" ")
        };
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            doc.authorization_endpoint,
            urlencode(&self.settings.client_id),
            urlencode(&self.settings.redirect_uri),
            urlencode(&scopes),
            urlencode(state),
        )
    }

    /// Project verified ID-token claims into an identity.
    fn identity_from_claims(
        &self,
        claims: &serde_json::Value,
    ) -> Result<Identity, AuthError> {
        let subject = claims
            .get(&self.settings.subject_claim)
            .and_then(|v| v.as_str())
            .ok_or(AuthError::BadCredentials)?;
        let mut identity = Identity::new(subject, self.id.clone())
            .with_claim("iss", self.settings.issuer.clone());
        for mapping in &self.settings.principal_mappings {
            let Some(value) = claims.get(&mapping.claim) else { continue };
            let values: Vec<String> = match value {
                serde_json::Value::String(s) => vec![s.clone()],
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                other => vec![other.to_string()],
            };
            for v in values {
                identity.principals.insert(mapping.template.replace("{value}", &v));
                identity.claims.insert(crate::identity::Claim::new(mapping.claim.clone(), v));
            }
        }
        Ok(identity)
    }

    async fn exchange_code(&self, code: &str) -> Result<String, AuthError> {
        let doc = self.discovery().await?;
        let params: HashMap<&str, &str> = HashMap::from([
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ]);
        let response = self
            .http
            .post(&doc.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?;
        if response.status().is_client_error() {
            return Err(AuthError::BadCredentials);
        }
        let token: TokenResponse = response
            .error_for_status()
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?;
        token.id_token.ok_or(AuthError::BadCredentials)
    }

    async fn verify_id_token(&self, token: &str) -> Result<serde_json::Value, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::BadCredentials)?;
        let key = self.decoding_key(header.kid.as_deref()).await?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.settings.issuer]);
        validation.set_audience(&[&self.settings.client_id]);
        validation.validate_exp = true;
        let data = decode::<serde_json::Value>(token, &key, &validation).map_err(|e| {
            warn!(authenticator = %self.id, error = %e, "ID token rejected");
            AuthError::BadCredentials
        })?;
        Ok(data.claims)
    }
}

#[async_trait]
impl AuthBackend for OidcBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            backend: "oidc",
            interactive: true,
            supports_key: false,
            supports_password: false,
            supports_federated: true,
        }
    }

    async fn authenticate(
        &self,
        ctx: &mut AuthContext,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, AuthError> {
        match credentials {
            Credentials::Begin => {
                let doc = self.discovery().await?;
                let mut raw = [0u8; 16];
                getrandom::getrandom(&mut raw).expect("system rng");
                let state = URL_SAFE_NO_PAD.encode(raw);
                let mut pending = PendingChallengeState::default();
                pending.data.insert("state".to_string(), state.clone());
                pending.issued_at = Some(chrono::Utc::now());
                ctx.challenges.insert(self.id.clone(), pending);
                let url = self.authorization_url(&doc, &state);
                Ok(AuthOutcome::Continue(Challenge::Redirect { url, state }))
            }
            Credentials::AuthCode { code } => {
                // The code is only accepted against an open challenge.
                if ctx.challenges.remove(&self.id).is_none() {
                    return Err(AuthError::BadCredentials);
                }
                let id_token = self.exchange_code(code).await?;
                let claims = self.verify_id_token(&id_token).await?;
                let identity = self.identity_from_claims(&claims)?;
                debug!(
                    authenticator = %self.id,
                    subject = %identity.subject,
                    principals = identity.principals.len(),
                    "OIDC identity confirmed"
                );
                Ok(AuthOutcome::Complete(identity))
            }
            _ => Err(AuthError::BadCredentials),
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
