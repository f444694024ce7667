//! Identity model: principals, claims and the merge into the effective
//! identity used for certificate signing.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::globpat::PrincipalPattern;

/// An SSH certificate principal. Sets are unordered and deduplicated, so
/// principal collections are `BTreeSet<Principal>` throughout.
pub type Principal = String;

/// A `(name, value)` pair annotating a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Claim {
    pub name: String,
    pub value: String,
}

impl Claim {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Produced by an auth backend when authentication succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub principals: BTreeSet<Principal>,
    pub claims: BTreeSet<Claim>,
    pub authenticator_id: String,
    pub confirmed_at: DateTime<Utc>,
}

impl Identity {
    pub fn new<S: Into<String>, A: Into<String>>(subject: S, authenticator_id: A) -> Self {
        Self {
            subject: subject.into(),
            principals: BTreeSet::new(),
            claims: BTreeSet::new(),
            authenticator_id: authenticator_id.into(),
            confirmed_at: Utc::now(),
        }
    }

    pub fn with_principals<I, P>(mut self, principals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Principal>,
    {
        self.principals.extend(principals.into_iter().map(Into::into));
        self
    }

    pub fn with_claim<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.claims.insert(Claim::new(name, value));
        self
    }
}

/// Per-authenticator restrictions applied while merging.
#[derive(Debug, Default)]
pub struct MergePolicy {
    /// authenticator id -> allow-list of principal patterns. An identity from
    /// an authenticator with a non-empty allow list only contributes
    /// principals matching at least one pattern.
    pub principals_allow: HashMap<String, Vec<PrincipalPattern>>,
    /// authenticator id -> claim names to keep. Empty list keeps everything.
    pub claims_filter: HashMap<String, Vec<String>>,
    /// ids of the authenticators marked `required`, in configured order.
    pub required_order: Vec<String>,
}

/// The merged view used to build the certificate template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveIdentity {
    pub principals: BTreeSet<Principal>,
    pub claims: BTreeSet<Claim>,
    pub key_id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("no eligible principals after filtering")]
    NoEligiblePrincipals,
    #[error("no identities to merge")]
    NoIdentities,
}

/// Merge a list of identities into the effective identity.
///
/// Principals are unioned, restricted per-backend by the allow lists, then
/// filtered by the request globs: `include` keeps matches, `exclude` drops
/// matches, in that order. The result must be non-empty.
pub fn merge_identities(
    identities: &[Identity],
    policy: &MergePolicy,
    include: Option<&PrincipalPattern>,
    exclude: Option<&PrincipalPattern>,
) -> Result<EffectiveIdentity, MergeError> {
    if identities.is_empty() {
        return Err(MergeError::NoIdentities);
    }

    let mut principals: BTreeSet<Principal> = BTreeSet::new();
    let mut claims: BTreeSet<Claim> = BTreeSet::new();
    for id in identities {
        let allow = policy.principals_allow.get(&id.authenticator_id);
        for p in &id.principals {
            let allowed = match allow {
                Some(patterns) if !patterns.is_empty() => patterns.iter().any(|g| g.matches(p)),
                _ => true,
            };
            if allowed {
                principals.insert(p.clone());
            }
        }
        let keep_claims = policy.claims_filter.get(&id.authenticator_id);
        for c in &id.claims {
            let kept = match keep_claims {
                Some(names) if !names.is_empty() => names.iter().any(|n| n == &c.name),
                _ => true,
            };
            if kept {
                claims.insert(c.clone());
            }
        }
    }

    if let Some(inc) = include {
        principals.retain(|p| inc.matches(p));
    }
    if let Some(exc) = exclude {
        principals.retain(|p| !exc.matches(p));
    }
    if principals.is_empty() {
        return Err(MergeError::NoEligiblePrincipals);
    }

    Ok(EffectiveIdentity { principals, claims, key_id: key_id_for(identities, policy) })
}

/// Stable key id: subject of the first required identity, a slash, then the
/// sorted set of contributing authenticator ids.
fn key_id_for(identities: &[Identity], policy: &MergePolicy) -> String {
    let subject = policy
        .required_order
        .iter()
        .find_map(|req| {
            identities
                .iter()
                .find(|id| &id.authenticator_id == req)
                .map(|id| id.subject.as_str())
        })
        .unwrap_or_else(|| identities[0].subject.as_str());

    let mut ids: Vec<&str> = identities.iter().map(|i| i.authenticator_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    format!("{}/{}", subject, ids.join("+"))
}
