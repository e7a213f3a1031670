use thiserror::Error;

/// Failure taxonomy for mutation operations. Only the originating
/// connection ever sees one of these; the `Display` text is what goes into
/// the unicast error event, so store internals stay out of it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed id")]
    MalformedId,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not allowed to {0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("storage error")]
    Store(#[from] anyhow::Error),
}
