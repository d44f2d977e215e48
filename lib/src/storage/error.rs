use std::error::Error;
use std::io;
use thiserror::Error;

/// An error related to storage operations (reads, writes, syncs...).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Error from the OS I/O layer.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Error related to data corruption.
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
    /// A term could not be turned into an identifier.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// The store was opened or configured with inconsistent options.
    #[error("invalid store configuration: {0}")]
    Config(String),
    #[doc(hidden)]
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl StorageError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Other(format!("the {what} lock is poisoned").into())
    }
}

/// An error returned if some content in the database is corrupted.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct CorruptionError(CorruptionErrorKind);

/// An error returned if some content in the database is corrupted.
#[derive(Debug, Error)]
enum CorruptionErrorKind {
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl CorruptionError {
    /// Builds an error from a printable error message.
    #[inline]
    pub(crate) fn new(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self(CorruptionErrorKind::Other(error.into()))
    }

    /// Builds an error from a printable error message.
    #[inline]
    pub(crate) fn msg(msg: impl Into<String>) -> Self {
        Self(CorruptionErrorKind::Msg(msg.into()))
    }
}

/// A failure while computing the identifier of a term.
///
/// Encoding failures are fatal to the statement being encoded: no fallback identifier exists.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncodingError {
    /// The digest engine refused to produce its output.
    #[error("digest finalization failed: {0}")]
    Digest(digest::InvalidBufferSize),
    /// A part of the canonical form of the term does not fit a u32 length.
    #[error("a term part of {0} bytes is too large to be encoded")]
    TermTooLarge(usize),
    /// Every identifier has been tried without finding a free slot.
    #[error("the identifier space is exhausted")]
    IdentifierSpaceExhausted,
    /// The shared digest pool can no longer be used.
    #[error("the digest pool lock is poisoned")]
    PoolPoisoned,
}
