//! Composite keys addressing one identifier within a scope.

/// A key that uniquely identifies an identifier within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// The scope (policy namespace) this key belongs to
    pub scope: String,
    /// The rate limited identifier (user id, IP address, ...)
    pub identifier: String,
}

impl Key {
    pub fn new(scope: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identifier: identifier.into(),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.identifier)
    }
}
