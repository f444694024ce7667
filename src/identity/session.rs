//! Server-side session state: `AuthContext` and the in-memory store.
//!
//! The store exclusively owns contexts. Lookups take a shared lock on the
//! map; mutations an exclusive one. Stepping through a session's state
//! machine additionally takes the per-session mutex so concurrent requests
//! against one session are totally ordered. A background reaper sweeps
//! expired entries.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::principal::Identity;

/// Default session TTL when the realm does not configure one.
pub const DEFAULT_TTL_SECS: i64 = 300;

fn gen_id() -> String {
    // 256-bit random id, base64url without padding
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).expect("system rng");
    URL_SAFE_NO_PAD.encode(buf)
}

/// Observable lifecycle state, derived from the context fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitAuth,
    Ready,
    Signed,
    Ended,
}

/// Scratch state for a backend's pending challenge. Backends are stateless
/// with respect to the context; whatever a multi-round-trip backend needs
/// between steps lives here, keyed by authenticator id.
#[derive(Debug, Clone, Default)]
pub struct PendingChallengeState {
    pub nonce: Vec<u8>,
    pub data: HashMap<String, String>,
    pub issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found or expired")]
    NotFound,
    #[error("public key already bound to this session")]
    PubkeyAlreadySet,
    #[error("unknown authenticator {0}")]
    UnknownAuthenticator(String),
    #[error("a live session already exists for this public key")]
    DuplicatePubkey,
}

#[derive(Debug)]
pub struct AuthContext {
    pub id: String,
    pub realm: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed: BTreeSet<String>,
    pub pending: BTreeSet<String>,
    pub identities: Vec<Identity>,
    pub pubkey: Option<ssh_key::PublicKey>,
    pub certificate: Option<ssh_key::Certificate>,
    pub challenges: HashMap<String, PendingChallengeState>,
    /// Authenticator ids that must all complete before the session is Ready.
    required: BTreeSet<String>,
}

impl AuthContext {
    pub fn new(realm: &str, authenticators: &[String], required: &[String], ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            id: gen_id(),
            realm: realm.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs.max(1)),
            completed: BTreeSet::new(),
            pending: authenticators.iter().cloned().collect(),
            identities: Vec::new(),
            pubkey: None,
            certificate: None,
            challenges: HashMap::new(),
            required: required.iter().cloned().collect(),
        }
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn state(&self) -> SessionState {
        if self.is_expired() {
            return SessionState::Ended;
        }
        if self.certificate.is_some() {
            return SessionState::Signed;
        }
        if self.pubkey.is_none() {
            return SessionState::Created;
        }
        if self.required.is_subset(&self.completed) {
            SessionState::Ready
        } else {
            SessionState::AwaitAuth
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), SessionState::Ready | SessionState::Signed)
    }

    /// Bind the subject public key. May be set only once.
    pub fn set_pubkey(&mut self, key: ssh_key::PublicKey) -> Result<(), SessionError> {
        if self.pubkey.is_some() {
            return Err(SessionError::PubkeyAlreadySet);
        }
        self.pubkey = Some(key);
        Ok(())
    }

    /// Record a successful authentication. Moves the authenticator from
    /// pending to completed so `completed` holds an id iff an identity with
    /// that id exists and `pending ∩ completed` stays empty.
    pub fn record_identity(&mut self, identity: Identity) -> Result<(), SessionError> {
        let aid = identity.authenticator_id.clone();
        if !self.pending.remove(&aid) && !self.completed.contains(&aid) {
            return Err(SessionError::UnknownAuthenticator(aid));
        }
        self.completed.insert(aid.clone());
        self.identities.push(identity);
        self.challenges.remove(&aid);
        Ok(())
    }

    /// Next authenticator to drive, by configured order.
    pub fn next_pending<'a>(&self, order: &'a [String]) -> Option<&'a String> {
        order.iter().find(|id| self.pending.contains(*id))
    }
}

struct SlotMap {
    sessions: HashMap<String, Arc<SessionSlot>>,
    /// pubkey fingerprint -> session id, for duplicate detection
    by_pubkey: HashMap<String, String>,
}

#[derive(Debug)]
pub struct SessionSlot {
    /// Per-session lock: one auth/sign step at a time within a session.
    pub ctx: tokio::sync::Mutex<AuthContext>,
}

pub struct SessionStore {
    inner: RwLock<SlotMap>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(SlotMap { sessions: HashMap::new(), by_pubkey: HashMap::new() }),
        })
    }

    /// Insert a freshly built context, registering its pubkey fingerprint.
    /// Fails if another live session holds the same public key.
    pub fn insert(&self, ctx: AuthContext) -> Result<(String, Arc<SessionSlot>), SessionError> {
        let fingerprint = ctx
            .pubkey
            .as_ref()
            .map(|k| k.fingerprint(ssh_key::HashAlg::Sha256).to_string());
        let id = ctx.id.clone();
        let mut map = self.inner.write();
        if let Some(fp) = &fingerprint {
            if let Some(existing) = map.by_pubkey.get(fp) {
                let live = map
                    .sessions
                    .get(existing)
                    .map(|slot| {
                        // Peek without the async lock: expiry only moves forward.
                        slot.ctx.try_lock().map(|c| !c.is_expired()).unwrap_or(true)
                    })
                    .unwrap_or(false);
                if live {
                    return Err(SessionError::DuplicatePubkey);
                }
            }
            map.by_pubkey.insert(fp.clone(), id.clone());
        }
        let slot = Arc::new(SessionSlot { ctx: tokio::sync::Mutex::new(ctx) });
        map.sessions.insert(id.clone(), slot.clone());
        Ok((id, slot))
    }

    /// Look up a live session. Expired sessions are dropped on access.
    pub fn get(&self, id: &str) -> Option<Arc<SessionSlot>> {
        let slot = self.inner.read().sessions.get(id).cloned()?;
        let expired = slot.ctx.try_lock().map(|c| c.is_expired()).unwrap_or(false);
        if expired {
            self.remove(id);
            return None;
        }
        Some(slot)
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut map = self.inner.write();
        let removed = map.sessions.remove(id);
        map.by_pubkey.retain(|_, sid| sid != id);
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every session past its expiry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let expired: Vec<String> = {
            let map = self.inner.read();
            map.sessions
                .iter()
                .filter(|(_, slot)| slot.ctx.try_lock().map(|c| c.is_expired()).unwrap_or(false))
                .map(|(id, _)| id.clone())
                .collect()
        };
        let count = expired.len();
        if count > 0 {
            let mut map = self.inner.write();
            for id in &expired {
                map.sessions.remove(id);
                map.by_pubkey.retain(|_, sid| sid != id);
            }
            debug!(removed = count, remaining = map.sessions.len(), "session sweep");
        }
        count
    }

    /// Background reaper. Takes the exclusive lock only briefly per sweep.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}
