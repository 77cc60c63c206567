//! Error taxonomy shared by the identity-resolution pipeline.

/// Failure kinds surfaced while resolving a file's identity.
///
/// Callers branch on the variant: only [`ResolveError::Transient`] is retried,
/// [`ResolveError::Config`] aborts before any network call, and everything else
/// is recorded against the single file being processed.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("missing configuration: {0} is not set")]
    Config(String),
    #[error("transient service error: {0}")]
    Transient(String),
    #[error("service error: {0}")]
    NonTransient(String),
    #[error("local i/o error: {0}")]
    LocalIo(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ResolveError {
    /// Returns `true` for connectivity/service-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn local_io(context: &str, error: &std::io::Error) -> Self {
        Self::LocalIo(format!("{context}: {error}"))
    }
}
