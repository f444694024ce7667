//!
//! inscribe HTTP server
//! --------------------
//! Axum-based HTTP API of the signing server.
//!
//! Responsibilities:
//! - Session creation against a submitted public key, bearer-token issuance.
//! - Driving the authentication pipeline one step per request.
//! - The signing endpoint with per-request deadlines.
//! - Signer custody endpoints (seal/unseal) behind the admin bearer.
//! - Optional remote-signing daemon endpoint.
//! - One structured log line per request; credentials never logged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::{AuthPipeline, Challenge, Credentials, PipelineError, StepResult};
use crate::config::{Config, RealmConfig};
use crate::error::{ApiError, ApiResult};
use crate::identity::{
    AuthContext, SessionError, SessionSlot, SessionStore, TokenKey,
};
use crate::signer::{CertTemplate, SerializedSigner, SignerBackend, SignerError, WireTemplate};
use crate::signflow::{self, SignRequest};

/// Deadline for authentication steps (backends may do network I/O).
const AUTH_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for signing.
const SIGN_DEADLINE: Duration = Duration::from_secs(5);

/// Shared server state injected into all handlers. Built once at startup
/// from the validated configuration; no ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub pipeline: Arc<AuthPipeline>,
    pub signer: Arc<SerializedSigner>,
    pub realm: Arc<RealmConfig>,
    pub token_key: TokenKey,
    pub audience: String,
    pub admin_secret: String,
    pub signing_daemon: bool,
}

impl AppState {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let fingerprints = config.ca_fingerprints().unwrap_or_default();
        let pipeline = Arc::new(config.build_pipeline(fingerprints)?);
        let signer = config.build_signer()?;
        let store = SessionStore::new();
        Ok(Self {
            store,
            pipeline,
            signer,
            realm: Arc::new(config.realm.clone()),
            token_key: TokenKey::generate(),
            audience: config.audience.clone(),
            admin_secret: config.admin_secret.clone(),
            signing_daemon: config.signing_daemon,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(|| async { "inscribe ok" }))
        .route("/ready", get(ready))
        .route("/authenticators", get(list_authenticators))
        .route("/auth", post(create_session).delete(destroy_session))
        .route("/auth/{authenticator_id}", post(auth_step))
        .route("/sign", post(sign))
        .route("/admin/unseal", post(admin_unseal))
        .route("/admin/seal", post(admin_seal));
    if state.signing_daemon {
        app = app.route("/signd/sign", post(signd_sign));
    }
    app.with_state(state)
}

/// Start the server: spawn the session reaper and serve until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;
    let sweep = Duration::from_secs((config.realm.session_ttl_secs / 4).clamp(5, 60) as u64);
    let _reaper = state.store.spawn_reaper(sweep);

    let app = build_router(state);
    let addr: SocketAddr = config.listen.parse()?;
    info!("starting inscribe server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Length-independent comparison for the admin bearer.
fn secret_matches(provided: &str, expected: &str) -> bool {
    let a = provided.as_bytes();
    let b = expected.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..b.len() {
        let x = a.get(i).copied().unwrap_or(0);
        diff |= (x ^ b[i]) as usize;
    }
    diff == 0
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    match bearer(headers) {
        Some(token) if secret_matches(token, &state.admin_secret) => Ok(()),
        _ => Err(ApiError::unauthenticated("admin credential required")),
    }
}

/// Resolve the session token to a live session slot.
fn require_session(state: &AppState, headers: &HeaderMap) -> ApiResult<(String, Arc<SessionSlot>)> {
    let token = bearer(headers).ok_or_else(|| ApiError::unauthenticated("missing token"))?;
    let payload = state
        .token_key
        .verify(token, &state.audience)
        .map_err(|e| ApiError::unauthenticated(e.to_string()))?;
    let slot = state
        .store
        .get(&payload.sid)
        .ok_or_else(|| ApiError::unauthenticated("session not found or expired"))?;
    Ok((payload.sid, slot))
}

fn log_request(endpoint: &str, session: &str, outcome: &str, started: Instant, auths: &str) {
    info!(
        target: "request",
        endpoint,
        session_id = session,
        outcome,
        elapsed_ms = started.elapsed().as_millis() as u64,
        authenticators = auths,
        "request handled"
    );
}

fn map_pipeline_error(err: PipelineError) -> ApiError {
    use crate::auth::AuthError;
    match err {
        PipelineError::Auth { authenticator, source } => match source {
            AuthError::BadCredentials => ApiError::auth_failed(format!(
                "authenticator {} rejected credentials",
                authenticator
            )),
            AuthError::Locked => {
                ApiError::auth_failed(format!("authenticator {}: account locked", authenticator))
            }
            AuthError::UpstreamUnavailable(detail) => {
                ApiError::upstream(format!("authenticator {}: {}", authenticator, detail))
            }
            AuthError::PolicyDenied(detail) => {
                ApiError::policy_denied(format!("authenticator {}: {}", authenticator, detail))
            }
            AuthError::Timeout => {
                ApiError::timeout(format!("authenticator {} timed out", authenticator))
            }
        },
        PipelineError::UnknownAuthenticator(id) => {
            ApiError::bad_request(format!("unknown authenticator {}", id))
        }
        PipelineError::Session(e) => map_session_error(e),
        PipelineError::InvalidConfig(detail) => ApiError::internal(detail),
    }
}

fn map_session_error(err: SessionError) -> ApiError {
    match err {
        SessionError::NotFound => ApiError::unauthenticated("session not found or expired"),
        SessionError::PubkeyAlreadySet => ApiError::conflict("public key already bound"),
        SessionError::UnknownAuthenticator(id) => {
            ApiError::bad_request(format!("unknown authenticator {}", id))
        }
        SessionError::DuplicatePubkey => {
            ApiError::conflict("a live session already exists for this public key")
        }
    }
}

async fn ready(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sealed": state.signer.is_sealed(),
        "sessions": state.store.len(),
    }))
}

async fn list_authenticators(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let _ = require_session(&state, &headers)?;
    Ok(Json(json!({ "authenticators": state.pipeline.describe() })))
}

#[derive(Debug, Deserialize)]
struct CreateSessionPayload {
    pubkey: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    let pubkey = ssh_key::PublicKey::from_openssh(&payload.pubkey)
        .map_err(|e| ApiError::bad_request(format!("unparseable public key: {}", e)))?;

    let mut ctx = AuthContext::new(
        &state.realm.name,
        state.pipeline.all_ids(),
        state.pipeline.required_ids(),
        state.realm.session_ttl_secs,
    );
    ctx.set_pubkey(pubkey).map_err(map_session_error)?;
    let expires_at = ctx.expires_at;
    let (sid, _slot) = state.store.insert(ctx).map_err(map_session_error)?;

    let token = state.token_key.issue(&sid, &state.audience, expires_at);
    log_request("POST /auth", &sid, "created", started, "");
    Ok(Json(json!({
        "token": token,
        "expires_at": expires_at.to_rfc3339(),
        "authenticators": state.pipeline.describe(),
    })))
}

async fn destroy_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    let (sid, _slot) = require_session(&state, &headers)?;
    state.store.remove(&sid);
    log_request("DELETE /auth", &sid, "destroyed", started, "");
    Ok(Json(json!({ "status": "ok" })))
}

/// Flat credential body; mapped onto the tagged `Credentials` variants by
/// which field is present.
#[derive(Debug, Default, Deserialize)]
struct CredentialBody {
    username: Option<String>,
    password: Option<String>,
    signature: Option<String>,
    code: Option<String>,
    certificate: Option<String>,
}

fn to_credentials(body: CredentialBody) -> Credentials {
    if let Some(certificate) = body.certificate {
        return Credentials::Certificate { certificate };
    }
    if let Some(signature) = body.signature {
        return Credentials::Signature { signature };
    }
    if let Some(code) = body.code {
        return Credentials::AuthCode { code };
    }
    if let Some(password) = body.password {
        return Credentials::Password { username: body.username.unwrap_or_default(), password };
    }
    Credentials::Begin
}

fn challenge_json(challenge: &Challenge) -> serde_json::Value {
    serde_json::to_value(challenge).unwrap_or_else(|_| json!({}))
}

async fn auth_step(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(authenticator_id): Path<String>,
    body: Option<Json<CredentialBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    let (sid, slot) = require_session(&state, &headers)?;
    let credentials = to_credentials(body.map(|Json(b)| b).unwrap_or_default());

    let step = async {
        let mut ctx = slot.ctx.lock().await;
        if ctx.is_expired() {
            return Err(ApiError::unauthenticated("session expired"));
        }
        state
            .pipeline
            .step(&mut ctx, Some(authenticator_id.as_str()), &credentials)
            .await
            .map_err(map_pipeline_error)
    };
    let result = tokio::time::timeout(AUTH_DEADLINE, step)
        .await
        .map_err(|_| ApiError::timeout("authentication deadline elapsed"));
    let result = match result {
        Ok(inner) => inner,
        Err(e) => Err(e),
    };

    match result {
        Ok(StepResult::Complete { authenticator_id, ready }) => {
            log_request("POST /auth/{id}", &sid, "ok", started, &authenticator_id);
            Ok(Json(json!({ "status": "ok", "ready": ready })))
        }
        Ok(StepResult::Challenge { authenticator_id, challenge }) => {
            log_request("POST /auth/{id}", &sid, "continue", started, &authenticator_id);
            Ok(Json(json!({ "status": "continue", "challenge": challenge_json(&challenge) })))
        }
        Err(err) => {
            log_request("POST /auth/{id}", &sid, err.kind(), started, &authenticator_id);
            Err(err)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SignPayload {
    /// Seconds or a duration string like "10m".
    lifetime: Option<serde_json::Value>,
    include: Option<String>,
    exclude: Option<String>,
}

fn lifetime_secs(raw: &Option<serde_json::Value>) -> ApiResult<Option<i64>> {
    match raw {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .filter(|v| *v > 0)
            .map(Some)
            .ok_or_else(|| ApiError::bad_request("lifetime must be a positive integer")),
        Some(serde_json::Value::String(s)) => crate::duration::parse_duration_secs(s)
            .map(Some)
            .map_err(ApiError::bad_request),
        Some(_) => Err(ApiError::bad_request("lifetime must be seconds or a duration string")),
    }
}

async fn sign(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<SignPayload>>,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    let (sid, slot) = require_session(&state, &headers)?;
    let payload = body.map(|Json(b)| b).unwrap_or_default();
    let request = SignRequest {
        lifetime_secs: lifetime_secs(&payload.lifetime)?,
        include: payload.include,
        exclude: payload.exclude,
    };

    // The flow runs detached: a disconnecting client or an elapsed deadline
    // must not lose a certificate the signer already produced, or retried
    // get_cert calls would stop being idempotent.
    let flow_state = state.clone();
    let flow_slot = slot.clone();
    let flow = tokio::spawn(async move {
        let mut ctx = flow_slot.ctx.lock().await;
        let auths = ctx.completed.iter().cloned().collect::<Vec<_>>().join("+");
        let signed = signflow::get_cert(
            &mut ctx,
            &flow_state.pipeline,
            &flow_state.realm,
            flow_state.signer.as_ref(),
            &request,
        )
        .await?;
        Ok::<_, ApiError>((auths, signed))
    });
    let result = match tokio::time::timeout(SIGN_DEADLINE, flow).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_error)) => Err(ApiError::internal(join_error.to_string())),
        Err(_) => Err(ApiError::timeout("signing deadline elapsed")),
    };

    match result {
        Ok((auths, signed)) => {
            log_request("POST /sign", &sid, "signed", started, &auths);
            Ok(Json(json!({
                "certificate": signed.certificate,
                "key_id": signed.key_id,
                "valid_after": signflow::rfc3339(signed.valid_after),
                "valid_before": signflow::rfc3339(signed.valid_before),
                "principals": signed.principals,
            })))
        }
        Err(err) => {
            log_request("POST /sign", &sid, err.kind(), started, "");
            Err(err)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdminPayload {
    secret: Option<String>,
}

async fn admin_unseal(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<AdminPayload>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let secret = body.and_then(|Json(b)| b.secret).unwrap_or_default();
    match state.signer.unseal(&secret).await {
        Ok(()) => {
            info!(signer = state.signer.id(), "unsealed by administrator");
            Ok(Json(json!({ "status": "ok", "sealed": false })))
        }
        Err(SignerError::BadSecret) => Err(ApiError::policy_denied("bad unseal secret")),
        Err(SignerError::Unavailable(detail)) => Err(ApiError::upstream(detail)),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

async fn admin_seal(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    state.signer.seal().await;
    info!(signer = state.signer.id(), "sealed by administrator");
    Ok(Json(json!({ "status": "ok", "sealed": true })))
}

/// Remote signing daemon endpoint: accepts a wire template, signs with the
/// local signer. Guarded by the admin bearer; only mounted in daemon mode.
async fn signd_sign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(wire): Json<WireTemplate>,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    require_admin(&state, &headers)?;
    let template = CertTemplate::from_wire(&wire)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let result = match tokio::time::timeout(SIGN_DEADLINE, state.signer.sign(&template)).await {
        Ok(inner) => inner,
        Err(_) => {
            log_request("POST /signd/sign", "-", "timeout", started, "");
            return Err(ApiError::timeout("signing deadline elapsed"));
        }
    };
    match result {
        Ok(cert) => {
            log_request("POST /signd/sign", "-", "signed", started, "");
            let encoded = cert
                .to_openssh()
                .map_err(|e| ApiError::internal(format!("certificate encoding: {}", e)))?;
            Ok(Json(json!({ "certificate": encoded })))
        }
        Err(SignerError::Sealed) => {
            log_request("POST /signd/sign", "-", "signer_sealed", started, "");
            Err(ApiError::signer_sealed("no key material available"))
        }
        Err(SignerError::Rejected(detail)) => {
            log_request("POST /signd/sign", "-", "rejected", started, "");
            Err(ApiError::bad_request(detail))
        }
        Err(e) => {
            log_request("POST /signd/sign", "-", "unavailable", started, "");
            Err(ApiError::upstream(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_comparison() {
        assert!(secret_matches("abc", "abc"));
        assert!(!secret_matches("abd", "abc"));
        assert!(!secret_matches("ab", "abc"));
        assert!(!secret_matches("abcd", "abc"));
        assert!(!secret_matches("", "abc"));
    }

    #[test]
    fn credential_mapping_precedence() {
        let c = to_credentials(CredentialBody {
            certificate: Some("cert".into()),
            signature: Some("sig".into()),
            ..Default::default()
        });
        assert!(matches!(c, Credentials::Certificate { .. }));

        let c = to_credentials(CredentialBody {
            username: Some("alice".into()),
            password: Some("pw".into()),
            ..Default::default()
        });
        assert!(matches!(c, Credentials::Password { .. }));

        let c = to_credentials(CredentialBody::default());
        assert!(matches!(c, Credentials::Begin));
    }

    #[test]
    fn lifetime_field_accepts_seconds_and_strings() {
        assert_eq!(lifetime_secs(&Some(serde_json::json!(600))).unwrap(), Some(600));
        assert_eq!(lifetime_secs(&Some(serde_json::json!("10m"))).unwrap(), Some(600));
        assert_eq!(lifetime_secs(&None).unwrap(), None);
        assert!(lifetime_secs(&Some(serde_json::json!(-5))).is_err());
        assert!(lifetime_secs(&Some(serde_json::json!({"x": 1}))).is_err());
    }
}
