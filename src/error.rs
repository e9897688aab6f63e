//! Error taxonomy shared by the pipeline components
//!
//! - `Fatal`: deployment/configuration problems, never retried
//! - `BadInput`: data errors (empty extraction, malformed score, bad upload)
//! - `NotFound`: unknown exam or job
//! - `Conflict`: an active job cannot be replaced
//! - `External`: AI service, object storage, Redis or renderer failures

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fatal configuration error: {0}")]
    Fatal(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl Error {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    pub fn bad_input(msg: impl Into<String>) -> Self {
        Error::BadInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Whether the queue may re-run the job after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Fatal(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::External(anyhow::Error::new(err).context("Redis command failed"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::External(anyhow::Error::new(err).context("JSON (de)serialization failed"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::External(anyhow::Error::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fatal_is_not_retryable() {
        assert!(!Error::fatal("pdftotext missing").is_retryable());
        assert!(Error::bad_input("No text found in PDF").is_retryable());
        assert!(Error::not_found("Exam not found").is_retryable());
        assert!(Error::External(anyhow::anyhow!("timeout")).is_retryable());
    }

    #[test]
    fn test_display_keeps_context_chain() {
        let err: Error = anyhow::anyhow!("connection reset")
            .context("upload failed")
            .into();
        assert_eq!(format!("{:#}", err), "upload failed: connection reset");
    }
}
