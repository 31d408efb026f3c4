/// The closed set of error kinds surfaced by the pipeline. These classify
/// failures for the ledger, logs and retry policy; each crate carries its own
/// typed error and maps into a kind at the orchestration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    UnknownProject,
    /// Study absent from both sources.
    NotFound,
    TransferTimeout,
    CacheUnstable,
    /// Not an error: the instance is excluded by project policy.
    SkipInstance,
    AnonymisationFailure,
    ValidationFailure,
    UploadFailure,
    SecretUnavailable,
    LedgerConflict,
    CircuitOpen,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::UnknownProject => "UnknownProject",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::TransferTimeout => "TransferTimeout",
            ErrorKind::CacheUnstable => "CacheUnstable",
            ErrorKind::SkipInstance => "SkipInstance",
            ErrorKind::AnonymisationFailure => "AnonymisationFailure",
            ErrorKind::ValidationFailure => "ValidationFailure",
            ErrorKind::UploadFailure => "UploadFailure",
            ErrorKind::SecretUnavailable => "SecretUnavailable",
            ErrorKind::LedgerConflict => "LedgerConflict",
            ErrorKind::CircuitOpen => "CircuitOpen",
        }
    }

    /// Kinds that are retried locally with backoff before being surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransferTimeout
                | ErrorKind::UploadFailure
                | ErrorKind::SecretUnavailable
                | ErrorKind::CircuitOpen
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
