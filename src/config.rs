//! Server configuration: YAML file read once at startup, validated, then
//! turned into the pipeline and signer objects that are passed by reference.
//! No ambient singletons.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::auth::{
    AuthPipeline, CertReauthBackend, LdapBackend, LdapSettings, OidcBackend, OidcSettings,
    PasswordBackend, PipelineEntry, PubkeyChallengeBackend,
};
use crate::signer::{AgentSigner, LocalSigner, RemoteSigner, SerializedSigner, SignerBackend};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8540";

fn default_audience() -> String {
    "inscribe".to_string()
}

fn default_session_ttl() -> i64 {
    crate::identity::DEFAULT_TTL_SECS
}

fn default_min_lifetime() -> i64 {
    300
}

fn default_max_lifetime() -> i64 {
    86_400
}

fn default_extensions() -> Vec<String> {
    vec![
        "permit-X11-forwarding".to_string(),
        "permit-agent-forwarding".to_string(),
        "permit-port-forwarding".to_string(),
        "permit-pty".to_string(),
        "permit-user-rc".to_string(),
    ]
}

fn default_subject_claim() -> String {
    "sub".to_string()
}

fn default_group_attribute() -> String {
    "cn".to_string()
}

/// Named policy bundle: session TTL, certificate lifetime bounds, critical
/// options and extensions stamped into every certificate.
#[derive(Debug, Clone, Deserialize)]
pub struct RealmConfig {
    #[serde(default = "default_realm_name")]
    pub name: String,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: i64,
    #[serde(default = "default_min_lifetime")]
    pub min_lifetime_secs: i64,
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: i64,
    #[serde(default)]
    pub force_command: Option<String>,
    #[serde(default)]
    pub source_address: Option<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_realm_name() -> String {
    "default".to_string()
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            name: default_realm_name(),
            session_ttl_secs: default_session_ttl(),
            min_lifetime_secs: default_min_lifetime(),
            max_lifetime_secs: default_max_lifetime(),
            force_command: None,
            source_address: None,
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthenticatorKind {
    Password {
        auth_file: PathBuf,
    },
    Pubkey {
        trust_roots_file: PathBuf,
        #[serde(default)]
        principal_templates: Vec<String>,
    },
    Oidc {
        issuer: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default = "default_subject_claim")]
        subject_claim: String,
        #[serde(default)]
        principal_mappings: Vec<crate::auth::oidc::ClaimMapping>,
    },
    Ldap {
        url: String,
        bind_dn_template: String,
        group_search_base: String,
        group_filter_template: String,
        #[serde(default = "default_group_attribute")]
        group_attribute: String,
        #[serde(default)]
        principal_templates: Vec<String>,
    },
    CertReauth {},
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatorConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub principals_allow: Vec<String>,
    #[serde(default)]
    pub claims_filter: Vec<String>,
    #[serde(flatten)]
    pub kind: AuthenticatorKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignerKind {
    Local {
        key_file: PathBuf,
        /// Name of the environment variable carrying the passphrase. Unset
        /// or empty leaves an encrypted key sealed until an admin unseal.
        #[serde(default)]
        passphrase_env: Option<String>,
    },
    Agent {
        socket: PathBuf,
        /// OpenSSH-format public key of the CA key held by the agent.
        ca_public_key: String,
    },
    Remote {
        url: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: SignerKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Privileged bearer credential for /admin and the signing daemon.
    pub admin_secret: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    /// Expose `POST /signd/sign` so this instance can serve remote signers.
    #[serde(default)]
    pub signing_daemon: bool,
    #[serde(default)]
    pub realm: RealmConfig,
    pub authenticators: Vec<AuthenticatorConfig>,
    pub signer: SignerConfig,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config {}", path.as_ref().display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw).context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.admin_secret.trim().is_empty() {
            bail!("admin_secret must not be empty");
        }
        if self.authenticators.is_empty() {
            bail!("at least one authenticator must be configured");
        }
        if self.realm.min_lifetime_secs <= 0 {
            bail!("realm.min_lifetime_secs must be positive");
        }
        if self.realm.min_lifetime_secs > self.realm.max_lifetime_secs {
            bail!(
                "realm.min_lifetime_secs ({}) exceeds max_lifetime_secs ({})",
                self.realm.min_lifetime_secs,
                self.realm.max_lifetime_secs
            );
        }
        if self.realm.session_ttl_secs <= 0 {
            bail!("realm.session_ttl_secs must be positive");
        }
        Ok(())
    }

    /// Build the auth pipeline from configuration. This also enforces the
    /// composition rules (duplicate ids, required set, cert-reauth alone).
    pub fn build_pipeline(&self, ca_fingerprints: Vec<ssh_key::Fingerprint>) -> Result<AuthPipeline> {
        let mut entries = Vec::with_capacity(self.authenticators.len());
        for auth in &self.authenticators {
            let name = auth.name.clone().unwrap_or_else(|| auth.id.clone());
            let backend: Arc<dyn crate::auth::AuthBackend> = match &auth.kind {
                AuthenticatorKind::Password { auth_file } => {
                    Arc::new(PasswordBackend::from_file(&auth.id, &name, auth_file)?)
                }
                AuthenticatorKind::Pubkey { trust_roots_file, principal_templates } => {
                    let raw = std::fs::read_to_string(trust_roots_file).with_context(|| {
                        format!("reading trust roots {}", trust_roots_file.display())
                    })?;
                    let lines: Vec<String> = raw.lines().map(str::to_string).collect();
                    let roots = crate::auth::pubkey::parse_trust_roots(&lines);
                    if roots.is_empty() {
                        bail!("authenticator {}: no usable trust roots", auth.id);
                    }
                    Arc::new(PubkeyChallengeBackend::new(
                        &auth.id,
                        &name,
                        &self.audience,
                        roots,
                        principal_templates.clone(),
                    ))
                }
                AuthenticatorKind::Oidc {
                    issuer,
                    client_id,
                    client_secret,
                    redirect_uri,
                    scopes,
                    subject_claim,
                    principal_mappings,
                } => Arc::new(OidcBackend::new(
                    &auth.id,
                    &name,
                    OidcSettings {
                        issuer: issuer.clone(),
                        client_id: client_id.clone(),
                        client_secret: client_secret.clone(),
                        redirect_uri: redirect_uri.clone(),
                        scopes: scopes.clone(),
                        subject_claim: subject_claim.clone(),
                        principal_mappings: principal_mappings.clone(),
                    },
                )),
                AuthenticatorKind::Ldap {
                    url,
                    bind_dn_template,
                    group_search_base,
                    group_filter_template,
                    group_attribute,
                    principal_templates,
                } => Arc::new(LdapBackend::new(
                    &auth.id,
                    &name,
                    LdapSettings {
                        url: url.clone(),
                        bind_dn_template: bind_dn_template.clone(),
                        group_search_base: group_search_base.clone(),
                        group_filter_template: group_filter_template.clone(),
                        group_attribute: group_attribute.clone(),
                        principal_templates: principal_templates.clone(),
                    },
                )),
                AuthenticatorKind::CertReauth {} => Arc::new(CertReauthBackend::new(
                    &auth.id,
                    &name,
                    ca_fingerprints.clone(),
                )),
            };
            entries.push(PipelineEntry {
                backend,
                required: auth.required,
                order: auth.order,
                principals_allow: auth.principals_allow.clone(),
                claims_filter: auth.claims_filter.clone(),
            });
        }
        AuthPipeline::new(entries).map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    /// Build the configured signer, wrapped in the FIFO serialiser.
    pub fn build_signer(&self) -> Result<Arc<SerializedSigner>> {
        let inner: Arc<dyn SignerBackend> = match &self.signer.kind {
            SignerKind::Local { key_file, passphrase_env } => {
                let passphrase = passphrase_env
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .and_then(|var| std::env::var(var).ok());
                Arc::new(LocalSigner::from_file(
                    &self.signer.id,
                    key_file,
                    passphrase.as_deref(),
                )?)
            }
            SignerKind::Agent { socket, ca_public_key } => {
                let ca = ssh_key::PublicKey::from_openssh(ca_public_key)
                    .context("parsing signer ca_public_key")?;
                Arc::new(AgentSigner::new(&self.signer.id, socket.clone(), ca))
            }
            SignerKind::Remote { url } => {
                Arc::new(RemoteSigner::new(&self.signer.id, url, &self.admin_secret))
            }
        };
        Ok(Arc::new(SerializedSigner::new(inner)))
    }

    /// Fingerprints the cert-reauth backend should trust. For local signers
    /// this is derived from the key file; agent signers name the key
    /// explicitly; remote signers cannot attest one locally.
    pub fn ca_fingerprints(&self) -> Result<Vec<ssh_key::Fingerprint>> {
        match &self.signer.kind {
            SignerKind::Local { key_file, .. } => {
                let pem = std::fs::read_to_string(key_file)
                    .with_context(|| format!("reading CA key {}", key_file.display()))?;
                let key = ssh_key::PrivateKey::from_openssh(&pem)?;
                Ok(vec![key.public_key().fingerprint(ssh_key::HashAlg::Sha256)])
            }
            SignerKind::Agent { ca_public_key, .. } => {
                let ca = ssh_key::PublicKey::from_openssh(ca_public_key)?;
                Ok(vec![ca.fingerprint(ssh_key::HashAlg::Sha256)])
            }
            SignerKind::Remote { .. } => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
admin_secret: "sekrit"
authenticators:
  - id: pw
    type: password
    required: true
    order: 1
    auth_file: /etc/inscribe/users
signer:
  id: main
  type: local
  key_file: /etc/inscribe/ca_key
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let c = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(c.listen, DEFAULT_LISTEN);
        assert_eq!(c.audience, "inscribe");
        assert_eq!(c.realm.name, "default");
        assert_eq!(c.realm.session_ttl_secs, 300);
        assert_eq!(c.realm.max_lifetime_secs, 86_400);
        assert!(c.realm.extensions.contains(&"permit-pty".to_string()));
        assert!(!c.signing_daemon);
        assert!(matches!(c.signer.kind, SignerKind::Local { .. }));
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
listen: "0.0.0.0:443"
admin_secret: "sekrit"
audience: "corp"
signing_daemon: true
realm:
  name: corp
  session_ttl_secs: 120
  min_lifetime_secs: 60
  max_lifetime_secs: 3600
  force_command: "/usr/bin/landing"
  source_address: "10.0.0.0/8"
  extensions: [permit-pty]
authenticators:
  - id: pw
    name: "Passwords"
    type: password
    required: true
    order: 1
    principals_allow: ["*"]
    auth_file: /etc/inscribe/users
  - id: corp_idp
    type: oidc
    required: true
    order: 2
    issuer: https://idp.example.com
    client_id: inscribe
    client_secret: xyz
    redirect_uri: urn:ietf:wg:oauth:2.0:oob
    principal_mappings:
      - claim: groups
        template: "{value}"
  - id: directory
    type: ldap
    order: 3
    url: ldaps://ldap.example.com
    bind_dn_template: "uid={username},ou=people,dc=example,dc=com"
    group_search_base: "ou=groups,dc=example,dc=com"
    group_filter_template: "(member={dn})"
  - id: reauth
    type: cert_reauth
    order: 4
signer:
  id: agent
  type: agent
  socket: /run/ssh-agent.sock
  ca_public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPlaceholderPlaceholderPlaceholderPlacehol ca"
"#;
        let c = Config::from_yaml(yaml).unwrap();
        assert_eq!(c.authenticators.len(), 4);
        assert!(c.signing_daemon);
        assert_eq!(c.realm.force_command.as_deref(), Some("/usr/bin/landing"));
        assert!(matches!(c.signer.kind, SignerKind::Agent { .. }));
    }

    #[test]
    fn rejects_empty_admin_secret() {
        let yaml = MINIMAL.replace("\"sekrit\"", "\"\"");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_inverted_lifetime_bounds() {
        let yaml = format!(
            "{}\nrealm:\n  min_lifetime_secs: 600\n  max_lifetime_secs: 60\n",
            MINIMAL.trim_end()
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_unknown_authenticator_type() {
        let yaml = MINIMAL.replace("type: password", "type: telepathy");
        assert!(Config::from_yaml(&yaml).is_err());
    }
}
