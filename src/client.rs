//! Client-side plumbing for the `sshi` command line tool: server API calls,
//! ad-hoc keypair generation and loading signed certificates into the local
//! SSH agent for the certificate's lifetime.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use ssh_key::{Algorithm, Certificate, HashAlg, LineEnding, PrivateKey};
use tracing::debug;

use crate::auth::pubkey::SIG_NAMESPACE;

/// Exit codes of the `sshi` binary.
pub const EXIT_OK: i32 = 0;
pub const EXIT_AUTH_OR_CONFIG: i32 = 1;
pub const EXIT_SERVER: i32 = 2;
pub const EXIT_SEALED: i32 = 3;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub timeout: Duration,
    pub retries: u32,
    pub debug: bool,
    pub insecure: bool,
    pub quiet: bool,
    pub loglevel: String,
    pub login_endpoints: Vec<String>,
    pub include_principals: Option<String>,
    pub exclude_principals: Option<String>,
    pub expire: Option<String>,
    pub genkey_type: String,
    pub genkey_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(2),
            retries: 3,
            debug: false,
            insecure: false,
            quiet: false,
            loglevel: "info".to_string(),
            login_endpoints: Vec::new(),
            include_principals: None,
            exclude_principals: None,
            expire: None,
            genkey_type: "ed25519".to_string(),
            genkey_size: 256,
        }
    }
}

impl ClientConfig {
    /// Resolve configuration from SSH_INSCRIBE_* environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(url) = env("SSH_INSCRIBE_URL") {
            config.url = url;
        }
        if let Some(raw) = env("SSH_INSCRIBE_TIMEOUT") {
            if let Ok(secs) = crate::duration::parse_duration_secs(&raw) {
                config.timeout = Duration::from_secs(secs.max(1) as u64);
            }
        }
        if let Some(raw) = env("SSH_INSCRIBE_RETRIES") {
            if let Ok(n) = raw.parse() {
                config.retries = n;
            }
        }
        config.debug = env("SSH_INSCRIBE_DEBUG").is_some();
        config.insecure = env("SSH_INSCRIBE_INSECURE").is_some();
        config.quiet = env("SSH_INSCRIBE_QUIET").is_some();
        if let Some(level) = env("SSH_INSCRIBE_LOGLEVEL") {
            config.loglevel = level;
        }
        if let Some(raw) = env("SSH_INSCRIBE_LOGIN_AUTH_ENDPOINTS") {
            config.login_endpoints = raw.split(',').map(|s| s.trim().to_string()).collect();
        }
        config.include_principals = env("SSH_INSCRIBE_INCLUDE_PRINCIPALS");
        config.exclude_principals = env("SSH_INSCRIBE_EXCLUDE_PRINCIPALS");
        config.expire = env("SSH_INSCRIBE_EXPIRE");
        if let Some(kt) = env("SSH_INSCRIBE_GENKEY_TYPE") {
            config.genkey_type = kt;
        }
        if let Some(ks) = env("SSH_INSCRIBE_GENKEY_SIZE") {
            if let Ok(n) = ks.parse() {
                config.genkey_size = n;
            }
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatorInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub backend: String,
    pub required: bool,
    pub order: i64,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub supports_password: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionHandle {
    pub token: String,
    pub expires_at: String,
    pub authenticators: Vec<AuthenticatorInfo>,
}

#[derive(Debug, Deserialize)]
pub struct StepResponse {
    pub status: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub challenge: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct SignResponse {
    pub certificate: String,
    pub key_id: String,
    pub valid_after: String,
    pub valid_before: String,
    pub principals: Vec<String>,
}

/// Server-reported error body.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{}: {}", .0.error, .0.detail.as_deref().unwrap_or(""))]
    Api(ApiErrorBody),
    #[error("server error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Api(body) if body.error == "signer_sealed" => EXIT_SEALED,
            ClientError::Api(body) => match body.error.as_str() {
                "auth_failed" | "unauthenticated" | "policy_denied" | "bad_request" => {
                    EXIT_AUTH_OR_CONFIG
                }
                _ => EXIT_SERVER,
            },
            ClientError::Transport(_) => EXIT_SERVER,
        }
    }
}

pub struct InscribeClient {
    base_url: String,
    http: reqwest::Client,
    retries: u32,
}

impl InscribeClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        if config.url.is_empty() {
            bail!("server URL not set; use --url or $SSH_INSCRIBE_URL");
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http,
            retries: config.retries.max(1),
        })
    }

    async fn handle(response: reqwest::Response) -> Result<serde_json::Value, ClientError> {
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if status.is_success() {
            return Ok(body);
        }
        match serde_json::from_value::<ApiErrorBody>(body) {
            Ok(api) => Err(ClientError::Api(api)),
            Err(_) => Err(ClientError::Transport(format!("server returned {}", status))),
        }
    }

    async fn post_with_retry(
        &self,
        path: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let mut last = ClientError::Transport("no attempts made".to_string());
        for attempt in 0..self.retries {
            let mut request = self.http.post(format!("{}{}", self.base_url, path)).json(&body);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(response) => return Self::handle(response).await,
                Err(e) => {
                    debug!(attempt, error = %e, "request failed, retrying");
                    last = ClientError::Transport(e.to_string());
                }
            }
        }
        Err(last)
    }

    pub async fn create_session(&self, pubkey: &str) -> Result<SessionHandle, ClientError> {
        let body = serde_json::json!({ "pubkey": pubkey });
        let value = self.post_with_retry("/auth", None, body).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Transport(e.to_string()))
    }

    pub async fn auth_step(
        &self,
        token: &str,
        authenticator_id: &str,
        body: serde_json::Value,
    ) -> Result<StepResponse, ClientError> {
        let value = self
            .post_with_retry(&format!("/auth/{}", authenticator_id), Some(token), body)
            .await?;
        serde_json::from_value(value).map_err(|e| ClientError::Transport(e.to_string()))
    }

    pub async fn sign(
        &self,
        token: &str,
        lifetime: Option<&str>,
        include: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<SignResponse, ClientError> {
        let body = serde_json::json!({
            "lifetime": lifetime,
            "include": include,
            "exclude": exclude,
        });
        let value = self.post_with_retry("/sign", Some(token), body).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Transport(e.to_string()))
    }

    pub async fn logout(&self, token: &str) -> Result<(), ClientError> {
        let request =
            self.http.delete(format!("{}{}", self.base_url, "/auth")).bearer_auth(token);
        if let Ok(response) = request.send().await {
            let _ = Self::handle(response).await?;
        }
        Ok(())
    }
}

/// Session tokens are MAC-protected but not encrypted; the session id needed
/// for challenge signatures is readable from the payload half.
pub fn session_id_from_token(token: &str) -> Result<String> {
    let (payload_b64, _mac) =
        token.split_once('.').ok_or_else(|| anyhow!("malformed session token"))?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| anyhow!("malformed session token: {}", e))?;
    let value: serde_json::Value =
        serde_json::from_slice(&payload).map_err(|e| anyhow!("malformed session token: {}", e))?;
    value
        .get("sid")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("session token carries no sid"))
}

/// Sign a pubkey-challenge nonce with a local private key.
pub fn answer_nonce_challenge(
    key: &PrivateKey,
    session_token_sid: &str,
    nonce_b64: &str,
    audience: &str,
) -> Result<String> {
    let nonce = URL_SAFE_NO_PAD
        .decode(nonce_b64)
        .map_err(|e| anyhow!("challenge nonce not base64url: {}", e))?;
    let msg = crate::auth::pubkey::PubkeyChallengeBackend::challenge_message(
        session_token_sid,
        &nonce,
        audience,
    );
    let sig = key
        .sign(SIG_NAMESPACE, HashAlg::Sha256, &msg)
        .context("signing challenge")?;
    Ok(sig.to_pem(LineEnding::LF)?)
}

/// Generate an ad-hoc keypair for one certificate lifetime.
pub fn generate_keypair(key_type: &str) -> Result<PrivateKey> {
    match key_type {
        "ed25519" => PrivateKey::random(&mut ssh_key::rand_core::OsRng, Algorithm::Ed25519)
            .context("generating ed25519 keypair"),
        other => bail!(
            "ad-hoc keypair type {:?} is not supported; use ed25519 or supply a key file",
            other
        ),
    }
}

pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    let key = PrivateKey::from_openssh(&pem)
        .with_context(|| format!("parsing key file {}", path.display()))?;
    if key.is_encrypted() {
        bail!("key file {} is passphrase-protected; decrypt it or use the agent", path.display());
    }
    Ok(key)
}

// SSH agent client bits for loading the signed certificate.

const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
const SSH_AGENT_SUCCESS: u8 = 6;
const SSH_AGENT_CONSTRAIN_LIFETIME: u8 = 1;

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    put_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

/// Load an ed25519 private key and its certificate into the agent under a
/// lifetime constraint, so the credential evaporates with the certificate.
pub async fn add_to_agent(
    socket: &Path,
    key: &PrivateKey,
    certificate: &Certificate,
    lifetime_secs: u32,
    comment: &str,
) -> Result<()> {
    use ssh_key::private::KeypairData;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let KeypairData::Ed25519(pair) = key.key_data() else {
        bail!("only ed25519 keys can be loaded into the agent by sshi");
    };

    // blob of the certificate (the part after the algorithm word)
    let line = certificate.to_openssh().context("encoding certificate")?;
    let cert_b64 = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed certificate line"))?;
    let cert_blob = base64::engine::general_purpose::STANDARD
        .decode(cert_b64)
        .context("decoding certificate blob")?;

    // private part: seed || public, 64 bytes
    let mut raw_private = Vec::with_capacity(64);
    raw_private.extend_from_slice(&pair.private.to_bytes());
    raw_private.extend_from_slice(pair.public.0.as_ref());

    let mut payload = vec![SSH_AGENTC_ADD_ID_CONSTRAINED];
    put_string(&mut payload, b"ssh-ed25519-cert-v01@openssh.com");
    put_string(&mut payload, &cert_blob);
    put_string(&mut payload, &raw_private);
    put_string(&mut payload, comment.as_bytes());
    payload.push(SSH_AGENT_CONSTRAIN_LIFETIME);
    put_u32(&mut payload, lifetime_secs);

    let mut framed = Vec::with_capacity(payload.len() + 4);
    put_u32(&mut framed, payload.len() as u32);
    framed.extend_from_slice(&payload);

    let mut stream = tokio::net::UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to agent at {}", socket.display()))?;
    stream.write_all(&framed).await.context("writing to agent")?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.context("reading agent response")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > 4096 {
        bail!("agent response framing error");
    }
    let mut response = vec![0u8; len];
    stream.read_exact(&mut response).await.context("reading agent response")?;
    if response[0] != SSH_AGENT_SUCCESS {
        bail!("agent refused the certificate (response {})", response[0]);
    }
    Ok(())
}
