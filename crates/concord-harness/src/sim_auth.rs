//! Credential scheme for simulations.
//!
//! Credentials are `role:identity`, e.g. `player:7` or `admin:1`. The
//! authenticator can be switched into an outage to exercise the resilience
//! guard around it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use concord_proto::{IdentityId, Role};
use concord_server::{AuthError, Authenticator, VerifiedIdentity};

/// Authenticator that trusts any well-formed `role:identity` credential.
///
/// Clones share the outage switch and the call counter.
#[derive(Clone, Default)]
pub struct SimAuthenticator {
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
}

impl SimAuthenticator {
    /// Create a healthy authenticator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Credential for a player.
    pub fn player(identity: u64) -> String {
        format!("player:{identity}")
    }

    /// Credential for a spectator.
    pub fn spectator(identity: u64) -> String {
        format!("spectator:{identity}")
    }

    /// Credential for an administrator.
    pub fn admin(identity: u64) -> String {
        format!("admin:{identity}")
    }

    /// Make every call fail with `AuthError::Unavailable` until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls that reached the authenticator.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for SimAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<VerifiedIdentity, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::Unavailable("simulated outage".to_owned()));
        }

        let (role, identity) = credential.split_once(':').ok_or(AuthError::Unauthenticated)?;
        let role = Role::parse(role).ok_or(AuthError::Unauthenticated)?;
        let identity = identity.parse::<u64>().map_err(|_| AuthError::Unauthenticated)?;

        Ok(VerifiedIdentity { identity: IdentityId(identity), role })
    }
}
