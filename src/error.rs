use std::path::PathBuf;

use crate::embedding::ModelTag;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("cannot extract text from {}: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    #[error(
        "index was built with {found} but the retriever uses {expected}; rebuild the index"
    )]
    DimensionMismatch { expected: ModelTag, found: ModelTag },

    #[error("unreadable index: {0}")]
    IndexFormat(String),

    #[error("retrieval timed out after {0:?}")]
    RetrievalTimeout(std::time::Duration),

    #[error("embedding error: {0}")]
    Embedding(String),
}

impl Error {
    pub(crate) fn extraction(
        path: impl Into<PathBuf>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Extraction {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
