//! Store key generation.

use super::types::LimitKind;

/// The two namespaces an identity occupies in the counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Request counter for the current window
    Count,
    /// Block flag set after the limit was exceeded
    Block,
}

impl KeySpace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeySpace::Count => "count",
            KeySpace::Block => "block",
        }
    }
}

/// A key in the counter store, rendered as `<space>:<kind>:<identity>`.
///
/// The layout is shared with every process using the same Redis instance and
/// must not change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub space: KeySpace,
    pub kind: LimitKind,
    pub identity: String,
}

impl StoreKey {
    /// Counter key for an identity.
    pub fn counter(kind: LimitKind, identity: &str) -> Self {
        Self {
            space: KeySpace::Count,
            kind,
            identity: identity.to_string(),
        }
    }

    /// Block key for an identity.
    pub fn block(kind: LimitKind, identity: &str) -> Self {
        Self {
            space: KeySpace::Block,
            kind,
            identity: identity.to_string(),
        }
    }

    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.space.prefix(), self.kind, self.identity)
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
