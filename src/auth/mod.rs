use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod resolver;

pub use resolver::*;

/// The resolved representation of "who is making this request".
///
/// Immutable once resolved for a given session snapshot; re-resolved from
/// the durable store on cache miss or expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: Option<String>,
    pub email: String,
    /// Upstream login provider, e.g. "google" or "github"
    pub auth_provider: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        auth_provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            email: email.into(),
            auth_provider: auth_provider.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of resolving a session id. Anonymous is a resolved state, not a
/// failure: it is cached like any other outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedIdentity {
    Known(Identity),
    Anonymous,
}

impl ResolvedIdentity {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            ResolvedIdentity::Known(identity) => Some(identity),
            ResolvedIdentity::Anonymous => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, ResolvedIdentity::Anonymous)
    }
}

/// Per-request identity binding.
///
/// A request object may be pooled by the calling layer, so the binding is
/// explicitly cleared at the start of every resolution cycle; a request must
/// never inherit a stale identity from a previous cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub trace_id: String,
    binding: Option<ResolvedIdentity>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            binding: None,
        }
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            binding: None,
        }
    }

    /// Clear the binding. Called before any resolution is attempted.
    pub fn reset(&mut self) {
        self.binding = None;
    }

    pub fn bind(&mut self, resolved: ResolvedIdentity) {
        self.binding = Some(resolved);
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.binding, Some(ResolvedIdentity::Known(_)))
    }

    /// The bound identity, if this request resolved to a known caller.
    pub fn identity(&self) -> Option<&Identity> {
        self.binding.as_ref().and_then(|r| r.identity())
    }

    /// Whether any resolution outcome (including Anonymous) has been bound.
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::new()
    }
}
