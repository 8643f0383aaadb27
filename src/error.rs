use thiserror::Error;

/// Errors surfaced by volume capture and metadata resource codec operations.
#[derive(Error, Debug)]
pub enum WimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to mount NTFS volume \"{0}\" read-only")]
    MountFailed(String),

    #[error("NTFS error on \"{path}\": {msg}")]
    Ntfs { path: String, msg: String },

    #[error("Error reading data from NTFS inode {mft_no}: {msg}")]
    VolumeRead { mft_no: u64, msg: String },

    #[error("Reparse data of \"{path}\" is invalid (only {size} bytes)")]
    InvalidReparseData { path: String, size: u64 },

    #[error("Invalid metadata resource at offset {offset}: {msg}")]
    InvalidMetadataResource { offset: u64, msg: String },

    #[error("Cannot archive \"{0}\": encrypted files and directories are not supported")]
    UnsupportedFile(String),

    #[error("Unexpected end of file")]
    UnexpectedEndOfFile,

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Operation aborted by progress callback")]
    AbortedByProgress,
}

pub type Result<T> = std::result::Result<T, WimError>;
