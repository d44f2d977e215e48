use crate::loader::LoadPhase;
use crate::storage::StorageError;
use thiserror::Error;

/// An error raised while bulk loading or rebuilding indexes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoaderError {
    /// The statement can't be loaded into the chosen target. Nothing of it has been written.
    #[error("statement {statement} is rejected: {message}")]
    InvalidStatement { statement: u64, message: String },
    /// Loading a statement failed in the storage layer.
    #[error("loading statement {statement} failed: {source}")]
    Statement {
        statement: u64,
        #[source]
        source: StorageError,
    },
    /// Building a secondary index failed.
    #[error("building the {index} index failed: {source}")]
    IndexBuild {
        index: String,
        #[source]
        source: StorageError,
    },
    /// A call was made in a phase that does not allow it.
    #[error("illegal load phase transition from {from} to {to}")]
    InvalidPhase { from: LoadPhase, to: LoadPhase },
    /// The session has already failed and can't be used anymore.
    #[error("the load session has been aborted by a previous error")]
    Aborted,
    #[error(transparent)]
    Storage(#[from] StorageError),
}
