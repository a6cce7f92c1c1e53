use std::io;

use thiserror::Error;

/// Error type surfaced by the trellis storage engine.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("node not found")]
    NodeNotFound,
    #[error("write log not found")]
    WriteLogNotFound,
    #[error("root not found")]
    RootNotFound,
    #[error("new root must follow the old root")]
    RootMustFollowOld,
    #[error("previous version of the old root has been pruned")]
    PreviousVersionMismatch,
    #[error("previous version has not been finalized")]
    NotFinalized,
    #[error("version has already been finalized")]
    AlreadyFinalized,
    #[error("version is not the earliest version")]
    NotEarliest,
    #[error("invalid multipart restore version")]
    InvalidMultipartVersion,
    #[error("a multipart restore is in progress")]
    MultipartInProgress,
    #[error("database is opened in read-only mode")]
    ReadOnly,
    #[error("store namespace does not match the configured namespace")]
    IncompatibleNamespace,
    #[error("store schema version is not supported")]
    IncompatibleVersion,
    #[error("namespace does not match the store")]
    BadNamespace,
    #[error("computed root {computed} does not match the expected root {expected}")]
    RootMismatch { expected: String, computed: String },
    #[error("checkpoint chunk {index} is corrupted")]
    ChunkCorrupted { index: usize },
    #[error("corrupted store: {0}")]
    Corrupt(String),
    #[error("encoding error: {0}")]
    Codec(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type DbResult<T> = Result<T, DbError>;
