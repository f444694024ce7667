//! LDAP authentication: bind as the user, then search group memberships and
//! project them through principal templates.

use ldap3::{dn_escape, ldap_escape, LdapConnAsync, Scope, SearchEntry};
use tracing::{debug, warn};

use async_trait::async_trait;

use super::{AuthBackend, AuthError, AuthOutcome, BackendInfo, Credentials};
use crate::identity::{AuthContext, Identity};

#[derive(Debug, Clone)]
pub struct LdapSettings {
    /// e.g. `ldaps://ldap.example.com:636`
    pub url: String,
    /// Bind DN template; `{username}` expands to the login name.
    pub bind_dn_template: String,
    /// Subtree base for the group search.
    pub group_search_base: String,
    /// Group filter template; `{dn}` and `{username}` expand.
    pub group_filter_template: String,
    /// Attribute naming the group, usually `cn`.
    pub group_attribute: String,
    /// Principal templates applied per group; `{group}` and `{username}` expand.
    pub principal_templates: Vec<String>,
}

pub struct LdapBackend {
    id: String,
    name: String,
    settings: LdapSettings,
}

impl LdapBackend {
    pub fn new(id: &str, name: &str, settings: LdapSettings) -> Self {
        Self { id: id.to_string(), name: name.to_string(), settings }
    }

    fn bind_dn(&self, username: &str) -> String {
        self.settings.bind_dn_template.replace("{username}", &dn_escape(username))
    }

    fn group_filter(&self, bind_dn: &str, username: &str) -> String {
        self.settings
            .group_filter_template
            .replace("{dn}", &ldap_escape(bind_dn))
            .replace("{username}", &ldap_escape(username))
    }

    fn principals_for(&self, username: &str, groups: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for template in &self.settings.principal_templates {
            if template.contains("{group}") {
                for g in groups {
                    out.push(template.replace("{group}", g).replace("{username}", username));
                }
            } else {
                out.push(template.replace("{username}", username));
            }
        }
        if out.is_empty() {
            out.push(username.to_string());
        }
        out
    }

    async fn bind_and_search(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Vec<String>, AuthError> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.settings.url)
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?;
        ldap3::drive!(conn);

        let dn = self.bind_dn(username);
        let bound = ldap
            .simple_bind(&dn, password)
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?;
        if bound.success().is_err() {
            let _ = ldap.unbind().await;
            return Err(AuthError::BadCredentials);
        }

        let filter = self.group_filter(&dn, username);
        let attr = self.settings.group_attribute.clone();
        let search = ldap
            .search(&self.settings.group_search_base, Scope::Subtree, &filter, vec![attr.as_str()])
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(e.to_string()))?;
        let (entries, _res) = match search.success() {
            Ok(ok) => ok,
            Err(e) => {
                warn!(authenticator = %self.id, error = %e, "group search failed");
                let _ = ldap.unbind().await;
                return Err(AuthError::UpstreamUnavailable(e.to_string()));
            }
        };
        let mut groups = Vec::new();
        for entry in entries {
            let entry = SearchEntry::construct(entry);
            if let Some(values) = entry.attrs.get(&attr) {
                groups.extend(values.iter().cloned());
            }
        }
        let _ = ldap.unbind().await;
        groups.sort();
        groups.dedup();
        Ok(groups)
    }
}

#[async_trait]
impl AuthBackend for LdapBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            backend: "ldap",
            interactive: true,
            supports_key: false,
            supports_password: true,
            supports_federated: false,
        }
    }

    async fn authenticate(
        &self,
        _ctx: &mut AuthContext,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, AuthError> {
        let Credentials::Password { username, password } = credentials else {
            return Err(AuthError::BadCredentials);
        };
        if password.is_empty() {
            // Many servers treat an empty password bind as anonymous success.
            return Err(AuthError::BadCredentials);
        }
        let groups = self.bind_and_search(username, password).await?;
        debug!(authenticator = %self.id, user = %username, groups = groups.len(), "LDAP bind ok");
        let mut identity = Identity::new(username.clone(), self.id.clone())
            .with_principals(self.principals_for(username, &groups));
        for g in &groups {
            identity.claims.insert(crate::identity::Claim::new("group", g.clone()));
        }
        Ok(AuthOutcome::Complete(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LdapSettings {
        LdapSettings {
            url: "ldap://localhost:1".into(),
            bind_dn_template: "uid={username},ou=people,dc=example,dc=com".into(),
            group_search_base: "ou=groups,dc=example,dc=com".into(),
            group_filter_template: "(member={dn})".into(),
            group_attribute: "cn".into(),
            principal_templates: vec!["{username}".into(), "ldap-{group}".into()],
        }
    }

    #[test]
    fn bind_dn_escapes_username() {
        let b = LdapBackend::new("ldap", "Directory", settings());
        let dn = b.bind_dn("alice,ou=evil");
        // The comma must not survive unescaped, or the user could graft RDNs.
        assert!(dn.starts_with("uid="));
        assert!(dn.ends_with(",ou=people,dc=example,dc=com"));
        assert!(!dn.contains("alice,ou=evil"));
    }

    #[test]
    fn principal_templates_fan_out_groups() {
        let b = LdapBackend::new("ldap", "Directory", settings());
        let got = b.principals_for("alice", &["dev".into(), "ops".into()]);
        assert_eq!(got, vec!["alice", "ldap-dev", "ldap-ops"]);
    }

    #[test]
    fn empty_templates_default_to_username() {
        let mut s = settings();
        s.principal_templates.clear();
        let b = LdapBackend::new("ldap", "Directory", s);
        assert_eq!(b.principals_for("bob", &["dev".into()]), vec!["bob"]);
    }

    #[tokio::test]
    async fn empty_password_rejected_before_bind() {
        let b = LdapBackend::new("ldap", "Directory", settings());
        let mut ctx = crate::identity::AuthContext::new(
            "default",
            &["ldap".to_string()],
            &["ldap".to_string()],
            60,
        );
        let creds = Credentials::Password { username: "alice".into(), password: "".into() };
        let err = b.authenticate(&mut ctx, &creds).await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials));
    }
}
