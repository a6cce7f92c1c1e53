use thiserror::Error;

use storage_trellis::DbError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Db(#[from] DbError),
    #[error("block history error: {0}")]
    History(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("remote storage error: {0}")]
    Remote(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("worker is shutting down")]
    Shutdown,
}

pub type SyncResult<T> = Result<T, SyncError>;
