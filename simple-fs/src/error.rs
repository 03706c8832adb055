use alloc::string::String;
use core::fmt;

use thiserror::Error;

/// Which allocation pool ran dry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// No free directory slot
    Directory,
    /// No free chain table entry
    ChainIndex,
    /// No free data block in the bitmap
    DataBlock,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Directory => "directory slots",
            Resource::ChainIndex => "chain table entries",
            Resource::DataBlock => "data blocks",
        })
    }
}

/// Every failure a volume operation can report
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SfsError {
    /// Operation issued before format/mount or after unmount
    #[error("volume is not mounted")]
    NotMounted,

    /// Descriptor missing, or its geometry disagrees with the device
    #[error("bad volume: {0}")]
    BadVolume(String),

    /// Name exceeds the directory entry's name field
    #[error("file name {name:?} is longer than {limit} bytes")]
    NameTooLong {
        /// Offending name
        name: String,
        /// Limit in bytes
        limit: usize,
    },

    /// Empty name or a name holding a NUL byte
    #[error("invalid file name {0:?}")]
    InvalidName(String),

    /// No directory entry with that name
    #[error("no such file: {0}")]
    NotFound(String),

    /// An allocation pool is exhausted
    #[error("volume full: out of {0}")]
    Full(Resource),

    /// Handle was never issued or has been closed
    #[error("invalid file handle {0}")]
    InvalidHandle(usize),

    /// The file behind the handle was removed while it was open
    #[error("file handle {0} refers to a removed file")]
    StaleHandle(usize),

    /// Write would push the file size past the u32 size field
    #[error("file would exceed the maximum size")]
    FileTooLarge,

    /// A chain walk ended early, looped, or disagrees with the bitmap
    #[error("corrupt chain at index {index}: {detail}")]
    CorruptChain {
        /// Chain index where the walk went wrong
        index: u32,
        /// What was wrong
        detail: String,
    },

    /// The block device refused the request
    #[error("I/O error at block {block}: {detail}")]
    Io {
        /// First block of the failed request
        block: usize,
        /// Device specific reason
        detail: String,
    },
}

/// Result alias used throughout the crate
pub type SfsResult<T> = Result<T, SfsError>;

impl SfsError {
    pub(crate) fn corrupt(index: u32, detail: impl Into<String>) -> Self {
        log::error!("chain corruption at index {}", index);
        SfsError::CorruptChain {
            index,
            detail: detail.into(),
        }
    }
}
