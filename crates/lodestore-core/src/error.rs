//! Error types for lodestore operations
//!
//! All failures are represented by the StoreError enum, with enough context
//! (paths, offsets, reasons) to diagnose what went wrong on disk.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Lodestore error types with detailed context
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Invalid store configuration (non-empty default value type,
    /// out-of-range buffer size, ...)
    Config {
        /// Human-readable description of the invalid setting
        reason: String,
    },

    /// The configured data path exists but is not a directory
    PathNotDirectory {
        /// The offending path
        path: PathBuf,
    },

    /// The configured data directory does not exist and `create_dir`
    /// was not requested
    DirectoryMissing {
        /// The missing directory
        path: PathBuf,
    },

    /// Creating the data directory failed
    DirectoryCreate {
        /// The directory that could not be created
        path: PathBuf,
        /// Description of the underlying failure
        message: String,
    },

    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A log or snapshot frame failed structural validation
    FrameCorrupt {
        /// File containing the bad frame
        path: PathBuf,
        /// Byte offset of the frame header
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Frame checksum verification failed
    ChecksumMismatch {
        /// File where the check failed
        path: PathBuf,
        /// Checksum stored in the frame header
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
        /// Byte offset of the frame header
        offset: u64,
    },

    /// The most recent snapshot could not be replayed. Fatal: event logs
    /// alone cannot reconstruct the state that preceded the snapshot.
    CorruptSnapshot {
        /// The unreadable snapshot file
        path: PathBuf,
        /// Description of the corruption
        reason: String,
    },

    /// Malformed serialized data: varint overflow, invalid discriminant,
    /// invalid partial-encoding header, length field over its cap
    Decode {
        /// Description of the malformation
        reason: String,
    },

    /// A value exceeds a serialization size limit
    Oversized {
        /// Observed size (bytes or element count)
        size: u64,
        /// The limit that was exceeded
        limit: u64,
        /// What was being measured ("bytes", "items", "frame payload", ...)
        kind: &'static str,
    },

    /// A cursor write or read ran out of buffer. Internal to serializer
    /// composition: aggregate implementations convert this into the
    /// bytes-required return value, so it never escapes to callers.
    InsufficientBuffer {
        /// Bytes required to make progress
        required: usize,
    },

    /// `save()` called before `load()` on a deferred-load store
    NotLoaded,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Config { reason } => {
                write!(f, "invalid store configuration: {}", reason)
            }

            StoreError::PathNotDirectory { path } => {
                write!(f, "data path {} is not a directory", path.display())
            }

            StoreError::DirectoryMissing { path } => {
                write!(f, "data directory {} does not exist", path.display())
            }

            StoreError::DirectoryCreate { path, message } => {
                write!(f, "cannot create data directory {}: {}", path.display(), message)
            }

            StoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            StoreError::FrameCorrupt { path, offset, reason } => {
                write!(f, "corrupt frame in {} at offset {}: {}", path.display(), offset, reason)
            }

            StoreError::ChecksumMismatch { path, expected, actual, offset } => {
                write!(
                    f,
                    "checksum mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                    path.display(),
                    offset,
                    expected,
                    actual
                )
            }

            StoreError::CorruptSnapshot { path, reason } => {
                write!(f, "corrupt snapshot {}: {}", path.display(), reason)
            }

            StoreError::Decode { reason } => {
                write!(f, "decode error: {}", reason)
            }

            StoreError::Oversized { size, limit, kind } => {
                write!(f, "{} too large: {} exceeds limit of {}", kind, size, limit)
            }

            StoreError::InsufficientBuffer { required } => {
                write!(f, "insufficient buffer: {} bytes required", required)
            }

            StoreError::NotLoaded => {
                write!(f, "store is not loaded; call load() first")
            }
        }
    }
}

impl Error for StoreError {}

/// Convert std::io::Error to StoreError::Io
impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Attach a file path to a bare I/O error, for error-site context.
    pub(crate) fn io(path: &std::path::Path, context: &str, err: io::Error) -> Self {
        StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }
}

/// Result type alias for lodestore operations
pub type StoreResult<T> = Result<T, StoreError>;
