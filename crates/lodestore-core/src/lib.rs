//! Lodestore Core: durable in-process key-value storage
//!
//! An embeddable store that keeps its entire working set in an in-memory
//! map and mirrors every mutation into a checksum-framed, append-only event
//! log. Periodic snapshots collapse history; startup deterministically
//! rebuilds the map by replaying the newest snapshot plus the event logs
//! that follow it.
//!
//! # Architecture
//!
//! - **Serialization**: the [`Record`] trait maps keys and values to a
//!   canonical byte layout: primitives, varints, containers, tuples, sum
//!   types, and user composites via [`record_struct!`], [`record_enum!`]
//!   and [`partial_record_struct!`].
//! - **Framing**: records pack into CRC-protected frames (CRC16-XMODEM for
//!   small payloads, CRC32C for large), each accepted or rejected whole at
//!   replay.
//! - **Store**: [`Store`] glues the two together: generation-numbered
//!   files, atomic-rename snapshots, crash recovery, and synchronous,
//!   async-cleanup or forked saves.
//!
//! ```no_run
//! use lodestore_core::{Bytes, SaveMode, Store, StoreFlags};
//!
//! # fn main() -> lodestore_core::StoreResult<()> {
//! let mut store: Store<Bytes, Bytes> =
//!     Store::open("./data", StoreFlags::new().create_dir())?;
//! store.update(Bytes::from("aabbcc"), Bytes::from("ddeeff"))?;
//! store.save(SaveMode::Sync)?;
//! # Ok(())
//! # }
//! ```

pub mod bytes;
pub mod composite;
pub mod containers;
pub mod error;
pub mod frame;
pub mod fsync;
pub mod map;
pub mod netaddr;
pub mod primitives;
pub mod serial;
pub mod store;

// Re-export key types for convenience
pub use bytes::Bytes;
pub use error::{StoreError, StoreResult};
pub use frame::{FrameReader, FrameWriter};
pub use map::KvMap;
pub use primitives::VarUint;
pub use serial::{EncodeContext, Record};
pub use store::{SaveMode, Store, StoreFlags, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
