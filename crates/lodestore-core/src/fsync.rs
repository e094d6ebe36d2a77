//! Platform durable-sync
//!
//! `flush(sync: true)` and snapshot finalization must put bytes on
//! persistent media, not just in the OS page cache. Each platform has a
//! different strongest primitive for that.

use std::fs::File;
use std::io;

/// Ensure file data is durably written to persistent storage.
///
/// - Linux: `fdatasync()`: syncs data without metadata, sufficient for an
///   append-only log.
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`: plain `fsync` on Apple platforms only
///   reaches the drive's volatile write cache.
/// - Elsewhere: `File::sync_data()`.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync on a file descriptor obtained from an open File.
        let rc = unsafe { libc::fdatasync(fd) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl(F_FULLFSYNC) on a file descriptor obtained from an
        // open File.
        let rc = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}
