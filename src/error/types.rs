use thiserror::Error;

/// Failures reaching the durable store (identity rows, encrypted secrets).
///
/// These are transient collaborator failures: they propagate to every waiter
/// on the affected resolution key and are never cached, so the next attempt
/// retries cleanly.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Unavailable(String),

    #[error("Store query failed: {0}")]
    QueryFailed(String),

    #[error("Store timeout: {0}")]
    Timeout(String),
}

/// Failures from the credential cipher.
///
/// `InvalidKey` is a configuration failure and is fatal at startup. The
/// remaining variants surface as "credential unusable" at the credential
/// layer, never as a request-level error.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Malformed encrypted payload: {0}")]
    Malformed(String),

    #[error("Authentication tag verification failed")]
    TagMismatch,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Invalid cipher key: {0}")]
    InvalidKey(String),
}

/// Failure resolving a session to an identity.
///
/// Clonable so a single in-flight resolution can hand the same failure to
/// every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Identity store failure: {0}")]
    Store(String),
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        ResolveError::Store(err.to_string())
    }
}

/// Failure constructing a client for (identity, provider).
///
/// Absent-by-design outcomes (no secret, bad format, undecryptable) are NOT
/// errors; this only covers store failures during the lookup. Clonable for
/// the same coalescing reason as [`ResolveError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Secret store failure: {0}")]
    Store(String),
}

impl From<StoreError> for CredentialError {
    fn from(err: StoreError) -> Self {
        CredentialError::Store(err.to_string())
    }
}
