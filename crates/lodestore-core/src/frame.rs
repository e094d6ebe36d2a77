//! Framed log format
//!
//! Event logs and snapshots share one on-disk unit: the frame. A frame is a
//! checksum-protected run of serialized records, accepted or rejected as a
//! whole at replay.
//!
//! Layout:
//!
//! ```text
//!   control byte:
//!     bits 0..4 : low 5 bits of payload length P
//!     bit 5     : 0 = CRC16-XMODEM (2 bytes), 1 = CRC32C (4 bytes)
//!     bits 6..7 : number of extra length bytes E in {0,1,2,3}
//!   extra length: E bytes little-endian, the high bits of P (shifted left 5)
//!   checksum:     2 or 4 bytes little-endian, over the payload only
//!   payload:      P bytes
//! ```
//!
//! CRC32C is selected for payloads of 512 bytes or more, or when the writer
//! is configured with `force_crc32`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crc::Crc;

use crate::error::{StoreError, StoreResult};
use crate::serial::Record;

/// Maximum frame payload size (2^29 bytes).
pub const MAX_FRAME_PAYLOAD: usize = 1 << 29;

/// Payloads at or above this size are protected by CRC32C instead of CRC16.
pub const CRC32_THRESHOLD: usize = 512;

/// Maximum frame header size: control + 3 length bytes + 4 checksum bytes.
const MAX_HEADER: usize = 8;

const CRC16_XMODEM: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_XMODEM);

fn checksum_of(payload: &[u8], use_crc32: bool) -> u32 {
    if use_crc32 {
        crc32c::crc32c(payload)
    } else {
        CRC16_XMODEM.checksum(payload) as u32
    }
}

/// Build the frame header for a payload. Returns the header bytes and length.
fn encode_header(payload_len: usize, use_crc32: bool, checksum: u32) -> ([u8; MAX_HEADER], usize) {
    let rest = payload_len >> 5;
    let extra = if rest == 0 {
        0
    } else if rest <= 0xFF {
        1
    } else if rest <= 0xFFFF {
        2
    } else {
        3
    };

    let mut hdr = [0u8; MAX_HEADER];
    hdr[0] = (payload_len & 0x1F) as u8 | if use_crc32 { 0x20 } else { 0 } | ((extra as u8) << 6);
    let mut at = 1;
    for byte in 0..extra {
        hdr[at] = ((rest >> (8 * byte)) & 0xFF) as u8;
        at += 1;
    }
    if use_crc32 {
        hdr[at..at + 4].copy_from_slice(&checksum.to_le_bytes());
        at += 4;
    } else {
        hdr[at..at + 2].copy_from_slice(&(checksum as u16).to_le_bytes());
        at += 2;
    }
    (hdr, at)
}

/// Append one frame to a file.
pub fn write_frame(
    file: &mut File,
    path: &Path,
    payload: &[u8],
    force_crc32: bool,
) -> StoreResult<()> {
    if payload.len() >= MAX_FRAME_PAYLOAD {
        return Err(StoreError::Oversized {
            size: payload.len() as u64,
            limit: MAX_FRAME_PAYLOAD as u64,
            kind: "frame payload",
        });
    }
    let use_crc32 = force_crc32 || payload.len() >= CRC32_THRESHOLD;
    let checksum = checksum_of(payload, use_crc32);
    let (hdr, hdr_len) = encode_header(payload.len(), use_crc32, checksum);

    file.write_all(&hdr[..hdr_len])
        .map_err(|e| StoreError::io(path, "write frame header", e))?;
    file.write_all(payload)
        .map_err(|e| StoreError::io(path, "write frame payload", e))
}

/// Accumulates serialized records into a payload buffer and emits frames.
///
/// The buffer starts at the configured size and grows to the power of two
/// covering the largest record seen, up to the configured maximum. When a
/// record does not fit the remaining space, the pending payload is emitted
/// as a frame first; records therefore never span frames.
pub struct FrameWriter {
    buffer: Vec<u8>,
    pending: usize,
    max_size: usize,
    /// Protect every frame with CRC32C regardless of payload size.
    pub force_crc32: bool,
}

impl FrameWriter {
    pub fn new(capacity: usize, max_size: usize) -> Self {
        FrameWriter {
            buffer: vec![0; capacity],
            pending: 0,
            max_size,
            force_crc32: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes of payload accumulated but not yet framed.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Bytes a record may occupy without forcing a frame emission.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pending
    }

    /// Drop any accumulated payload without writing it.
    pub fn discard(&mut self) {
        self.pending = 0;
    }

    /// Resize the buffer. The caller must have flushed or discarded any
    /// pending payload first.
    pub fn resize(&mut self, capacity: usize) {
        debug_assert_eq!(self.pending, 0);
        self.buffer.resize(capacity, 0);
        self.buffer.shrink_to_fit();
    }

    /// Serialize one record into the pending payload, emitting the current
    /// frame and growing the buffer as needed. Returns the record's size.
    pub fn write_record<T: Record>(
        &mut self,
        file: &mut File,
        path: &Path,
        record: &T,
    ) -> StoreResult<usize> {
        loop {
            let avail = self.buffer.len() - self.pending;
            let used = record.write(&mut self.buffer[self.pending..])?;
            if used <= avail {
                self.pending += used;
                return Ok(used);
            }
            // Whatever is already buffered goes out as its own frame.
            self.flush(file, path)?;
            if used > self.buffer.len() {
                let mut target = self.buffer.len().max(1) * 2;
                while target < used {
                    target *= 2;
                }
                if target > self.max_size {
                    return Err(StoreError::Oversized {
                        size: used as u64,
                        limit: self.max_size as u64,
                        kind: "record",
                    });
                }
                self.buffer.resize(target, 0);
            }
        }
    }

    /// Emit the pending payload as a frame, if there is any.
    pub fn flush(&mut self, file: &mut File, path: &Path) -> StoreResult<()> {
        if self.pending > 0 {
            let pending = self.pending;
            self.pending = 0;
            write_frame(file, path, &self.buffer[..pending], self.force_crc32)?;
        }
        Ok(())
    }
}

/// Reads frames back from a log or snapshot file, verifying checksums.
pub struct FrameReader {
    file: File,
    path: PathBuf,
    offset: u64,
}

impl FrameReader {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file =
            File::open(path).map_err(|e| StoreError::io(path, "open file for replay", e))?;
        Ok(FrameReader {
            file,
            path: path.to_path_buf(),
            offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last frame accepted.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_exact_or_torn(&mut self, buf: &mut [u8], what: &str) -> StoreResult<()> {
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StoreError::FrameCorrupt {
                    path: self.path.clone(),
                    offset: self.offset,
                    reason: format!("truncated {}", what),
                }
            } else {
                StoreError::io(&self.path, what, e)
            }
        })
    }

    /// Read and verify the next frame, replacing `payload` with its
    /// contents. Returns `Ok(false)` on a clean end of file.
    pub fn next_frame(&mut self, payload: &mut Vec<u8>) -> StoreResult<bool> {
        let frame_start = self.offset;

        let mut control = [0u8; 1];
        match self.file.read(&mut control) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) => return Err(StoreError::io(&self.path, "read frame control byte", e)),
        }
        let control = control[0];
        let extra = (control >> 6) as usize;
        let use_crc32 = control & 0x20 != 0;

        let mut extra_bytes = [0u8; 3];
        self.read_exact_or_torn(&mut extra_bytes[..extra], "frame length")?;
        let mut rest = 0u64;
        for (i, &b) in extra_bytes[..extra].iter().enumerate() {
            rest |= (b as u64) << (8 * i);
        }
        // The widest encodable length is 2^29 - 1, so no cap check is
        // needed on this side.
        let payload_len = (rest << 5) | (control & 0x1F) as u64;

        let mut checksum_bytes = [0u8; 4];
        let checksum_len = if use_crc32 { 4 } else { 2 };
        self.read_exact_or_torn(&mut checksum_bytes[..checksum_len], "frame checksum")?;
        let expected = if use_crc32 {
            u32::from_le_bytes(checksum_bytes)
        } else {
            u16::from_le_bytes([checksum_bytes[0], checksum_bytes[1]]) as u32
        };

        payload.resize(payload_len as usize, 0);
        self.read_exact_or_torn(payload, "frame payload")?;

        let actual = checksum_of(payload, use_crc32);
        if actual != expected {
            return Err(StoreError::ChecksumMismatch {
                path: self.path.clone(),
                expected,
                actual,
                offset: frame_start,
            });
        }

        self.offset = frame_start + 1 + extra as u64 + checksum_len as u64 + payload_len;
        Ok(true)
    }
}
