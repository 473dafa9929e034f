//! Authorization collaborator boundary.
//!
//! Credentials are opaque to the synchronization layer. Once per connection
//! the driver hands the credential from `Hello` to an [`Authenticator`] and
//! receives the identity and role behind it.

use std::collections::HashMap;

use async_trait::async_trait;
use concord_proto::{IdentityId, Role};
use thiserror::Error;

use crate::guard::DependencyFailure;

/// Identity and capabilities resolved from a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Authenticated identity.
    pub identity: IdentityId,
    /// Capability tag.
    pub role: Role,
}

/// Errors from the authorization collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The credential was missing, malformed, or rejected.
    #[error("credential rejected")]
    Unauthenticated,

    /// The collaborator could not be reached.
    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

impl DependencyFailure for AuthError {
    fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Resolves credentials to identities.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Verify `credential`.
    ///
    /// # Errors
    ///
    /// - `AuthError::Unauthenticated` if the credential is not accepted
    /// - `AuthError::Unavailable` if the collaborator is failing
    async fn authenticate(&self, credential: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// Static credential table.
///
/// Entries are written `secret=identity:role`, e.g. `s3cr3t=42:player`.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, VerifiedIdentity>,
}

impl TokenAuthenticator {
    /// Create an empty table; every credential is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `secret` as `identity` with `role`.
    #[must_use]
    pub fn with_token(mut self, secret: impl Into<String>, identity: IdentityId, role: Role) -> Self {
        self.tokens.insert(secret.into(), VerifiedIdentity { identity, role });
        self
    }

    /// Build a table from `secret=identity:role` entries.
    ///
    /// # Errors
    ///
    /// Returns the first malformed entry.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let mut table = Self::new();
        for entry in entries {
            let (secret, verified) = parse_entry(entry).ok_or_else(|| entry.to_owned())?;
            table.tokens.insert(secret.to_owned(), verified);
        }
        Ok(table)
    }

    /// Number of accepted credentials.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the table accepts nothing.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn parse_entry(entry: &str) -> Option<(&str, VerifiedIdentity)> {
    let (secret, rest) = entry.split_once('=')?;
    let (identity, role) = rest.split_once(':')?;
    if secret.is_empty() {
        return None;
    }

    let identity = IdentityId(identity.parse().ok()?);
    let role = Role::parse(role)?;
    Some((secret, VerifiedIdentity { identity, role }))
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<VerifiedIdentity, AuthError> {
        self.tokens.get(credential).copied().ok_or(AuthError::Unauthenticated)
    }
}
