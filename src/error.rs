//! Error kinds surfaced at the POSIX-facing boundary.
//!
//! Engine internals use `eyre::Result` and treat infrastructure failures
//! (mmap, ftruncate) as fatal. This module classifies the few conditions
//! that a caller must be able to act on, together with their errno mapping.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The path is not a file this engine manages (not PM-resident, not a
    /// regular file, or carries no signature). The caller should fall back
    /// to plain kernel syscalls.
    NotOurFile,
    /// A sized file carries a non-zero but mismatched signature.
    Corruption,
    /// The bitmap is exhausted and the file cannot grow further.
    OutOfSpace,
    /// An argument is outside POSIX bounds (negative seek, bad whence).
    InvalidArgument,
    /// Underlying I/O error from the kernel while opening or growing.
    Io(std::io::Error),
    /// Infrastructure invariant broken (mmap or shm setup failed). Fatal
    /// for the file; carries full context.
    Fatal(eyre::Report),
}

impl Error {
    /// The errno a POSIX entry point should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotOurFile => libc::ENOTSUP,
            Error::Corruption => libc::EINVAL,
            Error::OutOfSpace => libc::ENOSPC,
            Error::InvalidArgument => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Fatal(_) => libc::EIO,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotOurFile => write!(f, "file is not managed by this engine"),
            Error::Corruption => write!(f, "signature mismatch on existing file"),
            Error::OutOfSpace => write!(f, "no free blocks left in bitmap"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Fatal(report) => write!(f, "fatal engine error: {:#}", report),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<eyre::Report> for Error {
    fn from(report: eyre::Report) -> Self {
        Error::Fatal(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix_contract() {
        assert_eq!(Error::Corruption.errno(), libc::EINVAL);
        assert_eq!(Error::OutOfSpace.errno(), libc::ENOSPC);
        assert_eq!(Error::InvalidArgument.errno(), libc::EINVAL);
    }

    #[test]
    fn io_error_preserves_raw_errno() {
        let e = Error::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(e.errno(), libc::EACCES);
    }
}
