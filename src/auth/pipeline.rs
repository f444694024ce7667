//! Backend composition: drives authenticators in configured order, records
//! identities into the session and decides readiness.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::{AuthBackend, AuthError, AuthOutcome, BackendInfo, Challenge, Credentials};
use crate::globpat::PrincipalPattern;
use crate::identity::{AuthContext, MergePolicy, SessionError};

/// One configured authenticator: the backend plus its policy attributes.
pub struct PipelineEntry {
    pub backend: Arc<dyn AuthBackend>,
    pub required: bool,
    pub order: i64,
    pub principals_allow: Vec<String>,
    pub claims_filter: Vec<String>,
}

impl std::fmt::Debug for PipelineEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEntry")
            .field("backend", &self.backend.info().id)
            .field("required", &self.required)
            .field("order", &self.order)
            .field("principals_allow", &self.principals_allow)
            .field("claims_filter", &self.claims_filter)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("authenticator {authenticator}: {source}")]
    Auth { authenticator: String, source: AuthError },
    #[error("unknown authenticator {0}")]
    UnknownAuthenticator(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid authenticator configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of driving one authenticator one step.
#[derive(Debug)]
pub enum StepResult {
    Complete { authenticator_id: String, ready: bool },
    Challenge { authenticator_id: String, challenge: Challenge },
}

/// What `GET /authenticators` reports per backend.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatorDescription {
    #[serde(flatten)]
    pub info: BackendInfo,
    pub required: bool,
    pub order: i64,
}

#[derive(Debug)]
pub struct AuthPipeline {
    entries: Vec<PipelineEntry>,
    order: Vec<String>,
    required: Vec<String>,
    merge_policy: MergePolicy,
}

impl AuthPipeline {
    pub fn new(mut entries: Vec<PipelineEntry>) -> Result<Self, PipelineError> {
        if entries.is_empty() {
            return Err(PipelineError::InvalidConfig("no authenticators configured".into()));
        }
        entries.sort_by_key(|e| e.order);

        let mut seen = HashSet::new();
        for e in &entries {
            let id = e.backend.info().id;
            if !seen.insert(id.clone()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate authenticator id {:?}",
                    id
                )));
            }
        }

        let required: Vec<String> = entries
            .iter()
            .filter(|e| e.required)
            .map(|e| e.backend.info().id)
            .collect();
        if required.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one authenticator must be required".into(),
            ));
        }
        // Certificate reauth only proves a *prior* identity; it cannot be the
        // whole gate.
        let all_required_are_reauth = entries
            .iter()
            .filter(|e| e.required)
            .all(|e| e.backend.info().backend == "cert_reauth");
        if all_required_are_reauth {
            return Err(PipelineError::InvalidConfig(
                "cert_reauth cannot be the sole required authenticator".into(),
            ));
        }

        let order: Vec<String> = entries.iter().map(|e| e.backend.info().id).collect();

        let mut merge_policy = MergePolicy::default();
        merge_policy.required_order = required.clone();
        for e in &entries {
            let id = e.backend.info().id;
            if !e.principals_allow.is_empty() {
                let mut patterns = Vec::new();
                for src in &e.principals_allow {
                    patterns.push(
                        PrincipalPattern::new(src)
                            .map_err(PipelineError::InvalidConfig)?,
                    );
                }
                merge_policy.principals_allow.insert(id.clone(), patterns);
            }
            if !e.claims_filter.is_empty() {
                merge_policy.claims_filter.insert(id, e.claims_filter.clone());
            }
        }

        Ok(Self { entries, order, required, merge_policy })
    }

    pub fn all_ids(&self) -> &[String] {
        &self.order
    }

    pub fn required_ids(&self) -> &[String] {
        &self.required
    }

    pub fn merge_policy(&self) -> &MergePolicy {
        &self.merge_policy
    }

    pub fn describe(&self) -> Vec<AuthenticatorDescription> {
        self.entries
            .iter()
            .map(|e| AuthenticatorDescription {
                info: e.backend.info(),
                required: e.required,
                order: e.order,
            })
            .collect()
    }

    fn backend_by_id(&self, id: &str) -> Option<&PipelineEntry> {
        self.entries.iter().find(|e| e.backend.info().id == id)
    }

    /// Drive one authenticator a single step under the caller-held session
    /// lock. With an explicit id the authenticator must still be pending;
    /// without one the first pending authenticator in configured order runs.
    pub async fn step(
        &self,
        ctx: &mut AuthContext,
        authenticator_id: Option<&str>,
        credentials: &Credentials,
    ) -> Result<StepResult, PipelineError> {
        let target = match authenticator_id {
            Some(id) => {
                if !ctx.pending.contains(id) {
                    return Err(PipelineError::UnknownAuthenticator(id.to_string()));
                }
                id.to_string()
            }
            None => ctx
                .next_pending(&self.order)
                .cloned()
                .ok_or_else(|| PipelineError::UnknownAuthenticator("<none pending>".into()))?,
        };
        let entry = self
            .backend_by_id(&target)
            .ok_or_else(|| PipelineError::UnknownAuthenticator(target.clone()))?;

        let outcome = entry
            .backend
            .authenticate(ctx, credentials)
            .await
            .map_err(|source| PipelineError::Auth { authenticator: target.clone(), source })?;
        match outcome {
            AuthOutcome::Complete(identity) => {
                let subject = identity.subject.clone();
                ctx.record_identity(identity)?;
                let ready = ctx.is_ready();
                info!(
                    session = %ctx.id,
                    authenticator = %target,
                    subject = %subject,
                    ready,
                    "authentication step complete"
                );
                Ok(StepResult::Complete { authenticator_id: target, ready })
            }
            AuthOutcome::Continue(challenge) => {
                Ok(StepResult::Challenge { authenticator_id: target, challenge })
            }
        }
    }
}
