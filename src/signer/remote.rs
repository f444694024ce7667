//! Remote signer: the CA key lives on another host running the signing
//! daemon. Templates travel as JSON over an admin-bearer-authenticated
//! channel; the daemon answers with the finished OpenSSH certificate.

use std::time::Duration;

use serde::Deserialize;
use ssh_key::Certificate;
use tracing::debug;

use async_trait::async_trait;

use super::{CertTemplate, SignerBackend, SignerError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SignResponse {
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

pub struct RemoteSigner {
    id: String,
    base_url: String,
    admin_secret: String,
    http: reqwest::Client,
}

impl RemoteSigner {
    pub fn new(id: &str, base_url: &str, admin_secret: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_secret: admin_secret.to_string(),
            http,
        }
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, SignerError> {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.admin_secret)
            .json(body)
            .send()
            .await
            .map_err(|e| SignerError::Unavailable(format!("signing daemon: {}", e)))
    }
}

#[async_trait]
impl SignerBackend for RemoteSigner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn sign(&self, template: &CertTemplate) -> Result<Certificate, SignerError> {
        let body = serde_json::to_value(template.to_wire())
            .map_err(|e| SignerError::Rejected(e.to_string()))?;
        let response = self.post("/signd/sign", &body).await?;
        let status = response.status();
        if status.is_success() {
            let signed: SignResponse = response
                .json()
                .await
                .map_err(|e| SignerError::Unavailable(format!("signing daemon: {}", e)))?;
            debug!(signer = %self.id, key_id = %template.key_id, "remote daemon signed");
            return Certificate::from_openssh(&signed.certificate).map_err(|e| {
                SignerError::Unavailable(format!("daemon returned unparseable certificate: {}", e))
            });
        }
        let kind = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_default();
        if kind == "signer_sealed" {
            return Err(SignerError::Sealed);
        }
        if status.is_client_error() {
            return Err(SignerError::Rejected(format!("daemon refused template: {}", kind)));
        }
        Err(SignerError::Unavailable(format!("signing daemon returned {}", status)))
    }

    async fn unseal(&self, secret: &str) -> Result<(), SignerError> {
        let response =
            self.post("/admin/unseal", &serde_json::json!({ "secret": secret })).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SignerError::BadSecret);
        }
        Err(SignerError::Unavailable(format!("signing daemon returned {}", status)))
    }

    async fn seal(&self) {
        let _ = self.post("/admin/seal", &serde_json::json!({})).await;
    }

    /// Seal state lives with the daemon; locally we cannot observe it, so the
    /// signer reports unsealed and `sign` surfaces `Sealed` from the wire.
    fn is_sealed(&self) -> bool {
        false
    }
}
