use std::{path::PathBuf, time::Duration};

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

    #[error("search index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    /// Consumption ended without a document. Recorded by the task queue as
    /// the task's terminal error.
    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("{0}")]
    SanityCheckFailed(String),

    #[error("parser error: {0}")]
    Parser(String),

    #[error("barcode error: {0}")]
    Barcode(String),

    #[error(
        "classifier model changed on disk (expected generation {expected}, found {found})"
    )]
    ClassifierConflict { expected: u64, found: u64 },

    #[error("classifier training failed: {0}")]
    Training(String),

    #[error("index writer still locked after {0:?}")]
    IndexLocked(Duration),
}
