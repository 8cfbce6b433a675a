//! Store key layout.
//!
//! ```text
//! [<namespace>:]i:<scope>:<identifier>   bucket history
//! [<namespace>:]b:<scope>:<identifier>   block marker
//! [<namespace>:]disabled:<scope>         scope disable flag
//! ```

use crate::ratelimit::Key;

const HISTORY_PREFIX: &str = "i";
const BLOCK_PREFIX: &str = "b";
const DISABLED_PREFIX: &str = "disabled";

/// Builds store keys under an optional namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    namespace: Option<String>,
}

impl KeySpace {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }

    pub fn history_key(&self, key: &Key) -> String {
        self.join(&[HISTORY_PREFIX, &key.scope, &key.identifier])
    }

    pub fn block_key(&self, key: &Key) -> String {
        self.join(&[BLOCK_PREFIX, &key.scope, &key.identifier])
    }

    pub fn disabled_key(&self, scope: &str) -> String {
        self.join(&[DISABLED_PREFIX, scope])
    }

    /// Prefix shared by every history key in `scope`, trailing separator included.
    pub fn history_prefix(&self, scope: &str) -> String {
        format!("{}:", self.join(&[HISTORY_PREFIX, scope]))
    }

    /// Prefix shared by every block key in `scope`, trailing separator included.
    pub fn block_prefix(&self, scope: &str) -> String {
        format!("{}:", self.join(&[BLOCK_PREFIX, scope]))
    }

    /// Strip `prefix` from each full key, yielding identifiers.
    pub fn identifiers<I>(prefix: &str, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        keys.into_iter()
            .filter_map(|key| key.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    fn join(&self, parts: &[&str]) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, parts.join(":")),
            None => parts.join(":"),
        }
    }
}

/// Escape glob metacharacters so `prefix` matches literally in a KEYS pattern.
pub(crate) fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
