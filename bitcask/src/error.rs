use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds the engine can surface. None of these are retried
/// internally; every one is terminal to the operation that produced it.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SystemTime(#[from] std::time::SystemTimeError),

    #[error("on-disk index error: {0}")]
    Index(#[from] sled::Error),

    #[error("key is empty")]
    KeyIsEmpty,

    #[error("failed to update the in-memory index")]
    IndexUpdateFailed,

    #[error("key not found")]
    KeyNotFound,

    #[error("data file not found")]
    DataFileNotFound,

    #[error("the data directory may be corrupted")]
    DataDirectoryCorrupted,

    #[error("batch exceeds the configured max batch size")]
    ExceedMaxBatchNum,

    #[error("a merge is already in progress")]
    MergeIsProgress,

    #[error("the database directory is already in use by another instance")]
    DatabaseInUse,

    #[error("reclaimable ratio has not reached the configured merge threshold")]
    MergeRatioUnreached,

    #[error("not enough free disk space to perform a merge")]
    NoEnoughSpaceForMerge,

    #[error("log record CRC check failed, data may be corrupted")]
    InvalidCRC,

    #[error("directory path must not be empty")]
    DirPathIsEmpty,

    #[error("data file size must be greater than zero")]
    DataFileSizeTooSmall,

    #[error("data_file_merge_ratio must be in [0, 1]")]
    InvalidMergeRatio,

    #[error("failed to read the database directory")]
    FailedToReadDatabaseDir,

    #[error("failed to create the database directory")]
    FailedToCreateDatabaseDir,

    #[error("failed to copy the database directory: {0}")]
    FailedToCopyDirectory(String),

    #[error("memory-mapped files do not support write operations")]
    MmapWriteUnsupported,
}
