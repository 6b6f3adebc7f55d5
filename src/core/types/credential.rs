//! Login credentials attached to resources and change trackers.

/// A credential used to answer an HTTP authentication challenge.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// HTTP Basic username/password.
    Basic { username: String, password: String },
    /// OAuth-style bearer token.
    Bearer(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Credential::Bearer(token.into())
    }

    /// Username, for credentials that have one.
    pub fn username(&self) -> Option<&str> {
        match self {
            Credential::Basic { username, .. } => Some(username),
            Credential::Bearer(_) => None,
        }
    }
}

// Secrets stay out of logs and `dump()` output.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credential::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
        }
    }
}
