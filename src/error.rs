use std::path::PathBuf;

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

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Model(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "dataset has no column for required field '{field}' \
         (columns: {columns:?})"
    )]
    MissingColumn {
        field: &'static str,
        columns: Vec<String>,
    },

    #[error("dataset is empty: {0}")]
    EmptyDataset(PathBuf),

    #[error("index artifact missing: {0}")]
    MissingArtifact(PathBuf),

    #[error("metadata table has no row_id key table: {0}")]
    MissingRowIdKey(PathBuf),

    #[error(
        "vector count ({vectors}) does not match metadata row count ({rows})"
    )]
    CountMismatch { vectors: u64, rows: u64 },

    #[error(
        "vectors (build {vectors:?}) and metadata (build {metadata:?}) \
         come from different builds"
    )]
    BuildMismatch {
        vectors: Option<u64>,
        metadata: Option<u64>,
    },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("corrupt index artifact {path}: {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },

    #[error("no index store has been loaded yet")]
    StoreUnavailable,

    #[error("an index store is already installed")]
    StoreAlreadyInstalled,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("summary failed: {0}")]
    Summary(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::Model(format!("tensor computation error: {e}"))
    }
}

impl From<tokenizers::Error> for Error {
    fn from(e: tokenizers::Error) -> Self {
        Error::Model(format!("tokenizer error: {e}"))
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(e: hf_hub::api::sync::ApiError) -> Self {
        Error::Model(format!("model download failed: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Summary(e.to_string())
    }
}
