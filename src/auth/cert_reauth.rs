//! Re-authentication with a still-valid certificate issued by this CA.
//!
//! The presented certificate must verify against one of the CA fingerprints,
//! be a user certificate inside its validity window, and carry the same
//! subject public key the session is bound to. Its principals are accepted
//! verbatim. Policy forbids this backend from being the sole required
//! authenticator; that is enforced at configuration validation.

use ssh_key::certificate::CertType;
use ssh_key::{Certificate, Fingerprint};
use tracing::debug;

use async_trait::async_trait;

use super::{AuthBackend, AuthError, AuthOutcome, BackendInfo, Credentials};
use crate::identity::{AuthContext, Identity};

pub struct CertReauthBackend {
    id: String,
    name: String,
    ca_fingerprints: Vec<Fingerprint>,
}

impl CertReauthBackend {
    pub fn new(id: &str, name: &str, ca_fingerprints: Vec<Fingerprint>) -> Self {
        Self { id: id.to_string(), name: name.to_string(), ca_fingerprints }
    }

    fn check(&self, ctx: &AuthContext, cert: &Certificate) -> Result<(), AuthError> {
        if cert.cert_type() != CertType::User {
            return Err(AuthError::BadCredentials);
        }
        let fps: Vec<&Fingerprint> = self.ca_fingerprints.iter().collect();
        cert.validate(fps).map_err(|_| AuthError::BadCredentials)?;
        // The certificate must wrap the key this session is bound to, so a
        // stolen certificate is useless without the matching private key.
        match &ctx.pubkey {
            Some(bound) if bound.key_data() == cert.public_key() => Ok(()),
            _ => Err(AuthError::BadCredentials),
        }
    }
}

#[async_trait]
impl AuthBackend for CertReauthBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            backend: "cert_reauth",
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
        let Credentials::Certificate { certificate } = credentials else {
            return Err(AuthError::BadCredentials);
        };
        let cert = Certificate::from_openssh(certificate).map_err(|_| AuthError::BadCredentials)?;
        self.check(ctx, &cert)?;

        // key_id is `subject/authenticator-ids`; recover the subject half.
        let key_id = cert.key_id().to_string();
        let subject = key_id.split('/').next().unwrap_or(&key_id).to_string();
        debug!(authenticator = %self.id, key_id = %key_id, "certificate reauth accepted");
        let identity = Identity::new(subject, self.id.clone())
            .with_principals(cert.valid_principals().iter().cloned())
            .with_claim("prior_key_id", key_id);
        Ok(AuthOutcome::Complete(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::certificate::Builder;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, HashAlg, PrivateKey};

    fn ca() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    fn issue(
        ca: &PrivateKey,
        subject: &PrivateKey,
        key_id: &str,
        principals: &[&str],
        valid_for_secs: i64,
    ) -> Certificate {
        let now = chrono::Utc::now().timestamp();
        let valid_after = (now - 30).max(0) as u64;
        let valid_before = (now + valid_for_secs) as u64;
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().key_data().clone(),
            valid_after,
            valid_before,
        )
        .unwrap();
        builder.key_id(key_id).unwrap();
        builder.cert_type(CertType::User).unwrap();
        for p in principals {
            builder.valid_principal(*p).unwrap();
        }
        builder.sign(ca).unwrap()
    }

    fn ctx_with_key(key: &PrivateKey) -> AuthContext {
        let mut ctx = AuthContext::new(
            "default",
            &["reauth".to_string()],
            &["reauth".to_string()],
            60,
        );
        ctx.set_pubkey(key.public_key().clone()).unwrap();
        ctx
    }

    #[tokio::test]
    async fn valid_certificate_yields_verbatim_principals() {
        let ca = ca();
        let user = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = issue(&ca, &user, "alice/pw+oidc", &["alice", "dev"], 600);
        let backend = CertReauthBackend::new(
            "reauth",
            "Cert reauth",
            vec![ca.public_key().fingerprint(HashAlg::Sha256)],
        );
        let mut ctx = ctx_with_key(&user);
        let creds = Credentials::Certificate { certificate: cert.to_openssh().unwrap() };
        let AuthOutcome::Complete(id) = backend.authenticate(&mut ctx, &creds).await.unwrap()
        else {
            panic!("expected identity")
        };
        assert_eq!(id.subject, "alice");
        let got: Vec<&str> = id.principals.iter().map(String::as_str).collect();
        assert_eq!(got, vec!["alice", "dev"]);
    }

    #[tokio::test]
    async fn foreign_ca_rejected() {
        let ours = ca();
        let theirs = ca();
        let user = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = issue(&theirs, &user, "alice/pw", &["alice"], 600);
        let backend = CertReauthBackend::new(
            "reauth",
            "Cert reauth",
            vec![ours.public_key().fingerprint(HashAlg::Sha256)],
        );
        let mut ctx = ctx_with_key(&user);
        let creds = Credentials::Certificate { certificate: cert.to_openssh().unwrap() };
        let err = backend.authenticate(&mut ctx, &creds).await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials));
    }

    #[tokio::test]
    async fn expired_certificate_rejected() {
        let ca_key = ca();
        let user = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = issue(&ca_key, &user, "alice/pw", &["alice"], -60);
        let backend = CertReauthBackend::new(
            "reauth",
            "Cert reauth",
            vec![ca_key.public_key().fingerprint(HashAlg::Sha256)],
        );
        let mut ctx = ctx_with_key(&user);
        let creds = Credentials::Certificate { certificate: cert.to_openssh().unwrap() };
        let err = backend.authenticate(&mut ctx, &creds).await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials));
    }

    #[tokio::test]
    async fn certificate_for_other_key_rejected() {
        let ca_key = ca();
        let user = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let other = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = issue(&ca_key, &user, "alice/pw", &["alice"], 600);
        let backend = CertReauthBackend::new(
            "reauth",
            "Cert reauth",
            vec![ca_key.public_key().fingerprint(HashAlg::Sha256)],
        );
        // Session is bound to a different key than the certificate wraps.
        let mut ctx = ctx_with_key(&other);
        let creds = Credentials::Certificate { certificate: cert.to_openssh().unwrap() };
        let err = backend.authenticate(&mut ctx, &creds).await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials));
    }
}
