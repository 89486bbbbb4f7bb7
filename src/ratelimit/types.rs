//! Limit inputs and check results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of identity is being limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    /// Client network address
    Ip,
    /// API token
    Token,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Ip => "ip",
            LimitKind::Token => "token",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a single limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// The identity, e.g. an IP address or a token
    pub key: String,
    pub kind: LimitKind,
    /// Requests allowed before the identity is blocked
    pub max_requests: u64,
    pub block_duration: Duration,
}

/// Outcome of a limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// Requests left in the current window; always 0 when rejected
    pub remaining_requests: u64,
    /// When the block ends; set only when rejected
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    pub fn allowed(remaining_requests: u64) -> Self {
        Self {
            allowed: true,
            remaining_requests,
            blocked_until: None,
        }
    }

    pub fn blocked(blocked_until: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining_requests: 0,
            blocked_until: Some(blocked_until),
        }
    }
}

/// The subject of an admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Ip(String),
    Token(String),
}

impl Identity {
    /// Pick the identity for a request carrying an optional token and IP.
    ///
    /// A non-empty token always wins over the address.
    pub fn resolve(token: Option<&str>, ip: Option<&str>) -> Option<Self> {
        match (token.filter(|t| !t.is_empty()), ip.filter(|i| !i.is_empty())) {
            (Some(token), _) => Some(Identity::Token(token.to_string())),
            (None, Some(ip)) => Some(Identity::Ip(ip.to_string())),
            (None, None) => None,
        }
    }

    pub fn kind(&self) -> LimitKind {
        match self {
            Identity::Ip(_) => LimitKind::Ip,
            Identity::Token(_) => LimitKind::Token,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Identity::Ip(value) | Identity::Token(value) => value,
        }
    }
}
