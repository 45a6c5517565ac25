use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by store operations.
///
/// Foreground operations return these to the caller; background jobs
/// log them and record the outcome in a stat register instead (see
/// [`StatRegister::DatasortCompletionStatus`](super::stats::StatRegister)).
#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("record checksum mismatch")]
    ChecksumMismatch,

    #[error("record header in data file differs from index copy")]
    HeaderInconsistent,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Classic negative errno for this error kind.
    ///
    /// Used for the datasort completion status register and by
    /// embedders that bridge to errno based interfaces.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound => -libc::ENOENT,
            Error::ChecksumMismatch => -libc::EILSEQ,
            Error::HeaderInconsistent => -libc::EINVAL,
            Error::Io(err) => err.raw_os_error().map(|e| -e).unwrap_or(-libc::EIO),
            Error::InvalidArgument(_) => -libc::EINVAL,
            Error::OutOfMemory => -libc::ENOMEM,
            Error::Cancelled => -libc::EINTR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, Error::ChecksumMismatch)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(crate::tools::file::nix_to_io(err))
    }
}
