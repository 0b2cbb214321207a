//! Authenticated user identity
//!
//! Supplied by the authentication layer. Used both as the impersonation
//! identity when talking to clusters and as the key of the per-user namespace
//! cache.

use std::fmt;
use std::hash::{Hash, Hasher};

use zeroize::Zeroizing;

/// An authenticated user
#[derive(Clone, Default)]
pub struct UserPrincipal {
    /// User ID (username / subject)
    pub id: String,
    /// Groups the user belongs to
    pub groups: Vec<String>,
    /// Delegated bearer token (OIDC id token, PAT), used verbatim when present
    token: Option<Zeroizing<String>>,
}

impl UserPrincipal {
    /// Create a principal authenticated by ID and groups
    pub fn new(id: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            id: id.into(),
            groups,
            token: None,
        }
    }

    /// Attach a delegated bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() {
            None
        } else {
            Some(Zeroizing::new(token))
        };
        self
    }

    /// Delegated bearer token, if any
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.as_str())
    }

    /// A principal is usable if it carries either an ID or a token
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() || self.token.is_some()
    }

    /// Cache identity of this principal.
    ///
    /// ID and groups identify impersonated users. A token-only principal is
    /// identified by its token, since nothing else distinguishes it.
    pub fn cache_key(&self) -> UserKey {
        UserKey {
            id: self.id.clone(),
            groups: self.groups.clone(),
            token: if self.id.is_empty() {
                self.token.clone()
            } else {
                None
            },
        }
    }
}

impl fmt::Debug for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPrincipal")
            .field("id", &self.id)
            .field("groups", &self.groups)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id: {} // groups: {}", self.id, self.groups.join(", "))
    }
}

/// Hashable identity of a [`UserPrincipal`] for cache lookups
#[derive(Clone)]
pub struct UserKey {
    id: String,
    groups: Vec<String>,
    token: Option<Zeroizing<String>>,
}

impl UserKey {
    fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.as_str())
    }
}

impl PartialEq for UserKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.groups == other.groups && self.token() == other.token()
    }
}

impl Eq for UserKey {}

impl Hash for UserKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.groups.hash(state);
        self.token().hash(state);
    }
}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKey")
            .field("id", &self.id)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}
