use std::fmt;
use std::io;

/// Errors produced by the storage core.
///
/// This mirrors the flat, hand-rolled error enum the rest of the crate
/// favors over a derive-macro-based one: there is no vendored dependency
/// for it, just `Display` plus `std::error::Error`.
#[derive(Debug)]
pub enum Error {
    /// No blob is stored under the given key.
    NotFound(String),
    /// A key or blob violates a size bound, or a null key was used where
    /// one is required.
    InvalidArgument(String),
    /// Growing a container's directory past `MAX_FILE_SIZE` was attempted.
    FileSizeLimitExceeded,
    /// The on-disk file failed to parse as a KBF container.
    CorruptFile(String),
    /// The underlying filesystem reported an error.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "key not found: {key}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::FileSizeLimitExceeded => write!(f, "file size limit exceeded"),
            Error::CorruptFile(msg) => write!(f, "corrupt file: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
