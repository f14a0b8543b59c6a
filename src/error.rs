//! Failure modes of a single `/try` request.

use thiserror::Error;

/// Everything that can end a request before a link is returned.
///
/// Variants carry rendered messages instead of source errors so the enum stays
/// `Clone`: requests that join an in-flight fetch all observe the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The search collaborator returned zero results.
    #[error("No result found")]
    NoResult,
    #[error("search failed: {0}")]
    Search(String),
    /// The extraction API answered with a non-success status or timed out.
    #[error("extraction API error: {0}")]
    Upstream(String),
    #[error("No media found")]
    NoMediaFound,
    /// Candidates exist but none matches the requested media kind.
    #[error("no {0} candidate available")]
    NoSuitableCandidate(&'static str),
    #[error("download failed: {0}")]
    Download(String),
    /// Only ever raised inside the detached archive unit.
    #[error("archive upload failed: {0}")]
    ArchiveUpload(String),
    #[error("cache error: {0}")]
    Cache(String),
}

impl RelayError {
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Self::Upstream(err.to_string())
    }

    pub fn download(err: impl std::fmt::Display) -> Self {
        Self::Download(err.to_string())
    }

    /// Flattens an `anyhow` chain so the context survives into the message.
    pub fn archive(err: &anyhow::Error) -> Self {
        Self::ArchiveUpload(format!("{err:#}"))
    }
}
