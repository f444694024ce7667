//! Password authentication against a local credential file.
//!
//! The file holds one `user:argon2-phc[:principal,principal,...]` entry per
//! line. Unknown users are rejected indistinguishably from wrong passwords:
//! a dummy hash is verified on miss so both paths cost one argon2 run.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use password_hash::{PasswordHash, SaltString};
use tracing::info;

use super::{AuthBackend, AuthError, AuthOutcome, BackendInfo, Credentials};
use crate::identity::{AuthContext, Identity};

/// Consecutive failures before a user is locked out.
const LOCKOUT_THRESHOLD: u32 = 5;
/// How long a lockout lasts.
const LOCKOUT_SECS: i64 = 300;

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!(e.to_string()))?
        .to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else {
        false
    }
}

#[derive(Debug, Clone)]
struct UserEntry {
    phc: String,
    principals: Vec<String>,
}

#[derive(Debug, Default)]
struct FailureState {
    count: u32,
    last: Option<DateTime<Utc>>,
}

pub struct PasswordBackend {
    id: String,
    name: String,
    users: HashMap<String, UserEntry>,
    /// Verified on unknown users so misses cost the same as mismatches.
    dummy_phc: String,
    failures: Mutex<HashMap<String, FailureState>>,
}

impl PasswordBackend {
    pub fn from_file<P: AsRef<Path>>(id: &str, name: &str, path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading auth file {}", path.as_ref().display()))?;
        let mut users = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, ':');
            let user = parts.next().unwrap_or_default();
            let phc = parts.next().unwrap_or_default();
            if user.is_empty() || !phc.starts_with('$') {
                return Err(anyhow!("auth file line {}: expected user:phc[:principals]", lineno + 1));
            }
            let principals = match parts.next() {
                Some(list) if !list.trim().is_empty() => {
                    list.split(',').map(|p| p.trim().to_string()).collect()
                }
                _ => vec![user.to_string()],
            };
            users.insert(user.to_string(), UserEntry { phc: phc.to_string(), principals });
        }
        info!(authenticator = id, users = users.len(), "loaded password file");
        Ok(Self::from_entries(id, name, users))
    }

    /// Build from in-memory entries; `(user, phc, principals)` triples.
    pub fn from_users<I>(id: &str, name: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String, Vec<String>)>,
    {
        let users = entries
            .into_iter()
            .map(|(u, phc, principals)| (u, UserEntry { phc, principals }))
            .collect();
        Self::from_entries(id, name, users)
    }

    fn from_entries(id: &str, name: &str, users: HashMap<String, UserEntry>) -> Self {
        let mut noise = [0u8; 16];
        let _ = getrandom::getrandom(&mut noise);
        let dummy_phc = hash_password(&hex::encode(noise)).expect("dummy hash");
        Self {
            id: id.to_string(),
            name: name.to_string(),
            users,
            dummy_phc,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self, user: &str) -> bool {
        let map = self.failures.lock();
        match map.get(user) {
            Some(f) if f.count >= LOCKOUT_THRESHOLD => match f.last {
                Some(at) => Utc::now() < at + chrono::Duration::seconds(LOCKOUT_SECS),
                None => false,
            },
            _ => false,
        }
    }

    fn note_failure(&self, user: &str) {
        let mut map = self.failures.lock();
        let entry = map.entry(user.to_string()).or_default();
        entry.count += 1;
        entry.last = Some(Utc::now());
    }

    fn clear_failures(&self, user: &str) {
        self.failures.lock().remove(user);
    }
}

#[async_trait]
impl AuthBackend for PasswordBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            backend: "password",
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
        if self.locked(username) {
            return Err(AuthError::Locked);
        }
        let ok = match self.users.get(username) {
            Some(entry) => verify_password(&entry.phc, password),
            None => {
                // Burn a comparable verification, then fail.
                let _ = verify_password(&self.dummy_phc, password);
                false
            }
        };
        if !ok {
            self.note_failure(username);
            return Err(AuthError::BadCredentials);
        }
        self.clear_failures(username);
        let entry = &self.users[username];
        let identity = Identity::new(username.clone(), self.id.clone())
            .with_principals(entry.principals.iter().cloned());
        Ok(AuthOutcome::Complete(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> PasswordBackend {
        PasswordBackend::from_users(
            "pw",
            "Password",
            vec![(
                "alice".to_string(),
                hash_password("wonderland").unwrap(),
                vec!["alice".to_string(), "dev".to_string()],
            )],
        )
    }

    fn ctx() -> AuthContext {
        AuthContext::new("default", &["pw".to_string()], &["pw".to_string()], 60)
    }

    #[tokio::test]
    async fn accepts_correct_password_with_principals() {
        let b = backend();
        let creds = Credentials::Password { username: "alice".into(), password: "wonderland".into() };
        let out = b.authenticate(&mut ctx(), &creds).await.unwrap();
        let AuthOutcome::Complete(id) = out else { panic!("expected identity") };
        assert_eq!(id.subject, "alice");
        let got: Vec<&str> = id.principals.iter().map(String::as_str).collect();
        assert_eq!(got, vec!["alice", "dev"]);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_identical() {
        let b = backend();
        let wrong = Credentials::Password { username: "alice".into(), password: "nope".into() };
        let unknown = Credentials::Password { username: "mallory".into(), password: "nope".into() };
        let e1 = b.authenticate(&mut ctx(), &wrong).await.unwrap_err();
        let e2 = b.authenticate(&mut ctx(), &unknown).await.unwrap_err();
        assert!(matches!(e1, AuthError::BadCredentials));
        assert!(matches!(e2, AuthError::BadCredentials));
    }

    #[tokio::test]
    async fn lockout_after_repeated_failures() {
        let b = backend();
        let wrong = Credentials::Password { username: "alice".into(), password: "nope".into() };
        for _ in 0..LOCKOUT_THRESHOLD {
            let _ = b.authenticate(&mut ctx(), &wrong).await;
        }
        let creds = Credentials::Password { username: "alice".into(), password: "wonderland".into() };
        let err = b.authenticate(&mut ctx(), &creds).await.unwrap_err();
        assert!(matches!(err, AuthError::Locked));
    }

    #[test]
    fn file_parsing_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        let phc = hash_password("secret").unwrap();
        std::fs::write(&path, format!("# comment\nbob:{}:bob,ops\n\n", phc)).unwrap();
        let b = PasswordBackend::from_file("pw", "Password", &path).unwrap();
        assert!(b.users.contains_key("bob"));
        assert_eq!(b.users["bob"].principals, vec!["bob", "ops"]);
    }

    #[test]
    fn malformed_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "not-a-valid-line\n").unwrap();
        assert!(PasswordBackend::from_file("pw", "Password", &path).is_err());
    }
}
