//! Identity and session management for the signing server.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod token;

pub use principal::{
    merge_identities, Claim, EffectiveIdentity, Identity, MergeError, MergePolicy, Principal,
};
pub use session::{
    AuthContext, PendingChallengeState, SessionError, SessionSlot, SessionState, SessionStore,
    DEFAULT_TTL_SECS,
};
pub use token::{expiry_in, TokenError, TokenKey, TokenPayload, SKEW_SECS};
