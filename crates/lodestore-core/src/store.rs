//! The store state machine
//!
//! [`Store`] wraps an in-memory map and mirrors every mutation into a framed
//! append-only event log, with periodic full snapshots collapsing history.
//! The contract it preserves: after `load()`, the map equals the newest
//! snapshot folded with every later event record, applied in file order.
//!
//! **Write path**: record into the frame buffer, then apply to the map.
//! Log-before-apply means a crash mid-call never leaves the map ahead of
//! the disk state.
//! **Startup**: newest snapshot, then every event log with generation at or
//! after it, in ascending order. Corrupt event logs are unlinked and the
//! surviving state is immediately re-snapshotted; a corrupt snapshot is
//! fatal.
//!
//! A store owns its data directory exclusively and is single-owner: no
//! internal locking, not thread-safe. Dropping the store closes the log
//! without flushing; call `flush()` to make buffered mutations durable.

use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::frame::{FrameReader, FrameWriter};
use crate::fsync::durable_sync;
use crate::map::KvMap;
use crate::serial::{EncodeContext, Record};

/// Default initial frame buffer size (512 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// Maximum frame buffer size (512 MiB).
pub const MAX_BUFFER_SIZE: usize = 512 * 1024 * 1024;

const EVENTS_EXT: &str = "events";
const SNAPSHOT_EXT: &str = "snapshot";

/// Directory-handling options for [`Store::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFlags {
    create_dir: bool,
    delete_data: bool,
    defer_load: bool,
}

impl StoreFlags {
    pub fn new() -> Self {
        StoreFlags::default()
    }

    /// Create the data directory if it does not exist.
    pub fn create_dir(mut self) -> Self {
        self.create_dir = true;
        self
    }

    /// Remove any existing event logs and snapshots before loading.
    pub fn delete_data(mut self) -> Self {
        self.delete_data = true;
        self
    }

    /// Do not `load()` on open; the caller must call it before mutating.
    pub fn defer_load(mut self) -> Self {
        self.defer_load = true;
        self
    }
}

/// How [`Store::save`] distributes its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Snapshot on the calling thread; obsolete-file removal handed to a
    /// detached background task.
    AsyncClear,
    /// Every step on the calling thread.
    Sync,
    /// Snapshot written by a forked child process while the parent carries
    /// on immediately (unix). Degrades to `AsyncClear` elsewhere.
    Fork,
}

struct LogFile {
    file: File,
    path: PathBuf,
}

/// Extract `(generation, is_snapshot)` from a data file path. Files with
/// non-digit stems or foreign extensions are not ours and return None.
fn parse_generation(path: &Path) -> Option<(u64, bool)> {
    let is_snapshot = match path.extension()?.to_str()? {
        SNAPSHOT_EXT => true,
        EVENTS_EXT => false,
        _ => return None,
    };
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((stem.parse::<u64>().ok()?, is_snapshot))
}

fn generation_file_name(generation: u64, extension: &str) -> String {
    format!("{:020}.{}", generation, extension)
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            debug!(file = %path.display(), error = %err, "obsolete file removal failed");
        }
    }
}

/// A durable key-value map.
///
/// `M` is the in-memory container (default `hashbrown::HashMap`), `K` and
/// `V` any [`Record`] types. A default-constructed `V` must be empty: the
/// empty value is the deletion sentinel on disk.
pub struct Store<K, V, M = hashbrown::HashMap<K, V>> {
    objects: M,
    writer: FrameWriter,
    events: Option<LogFile>,
    dir: PathBuf,
    flags: StoreFlags,
    generation: u64,
    loaded: bool,
    #[cfg(unix)]
    children: Vec<i32>,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K, V, M> Store<K, V, M>
where
    K: Record,
    V: Record,
    M: KvMap<K, V>,
{
    /// Open a store over `dir` with the default buffer size.
    pub fn open(dir: impl AsRef<Path>, flags: StoreFlags) -> StoreResult<Self> {
        Self::open_with_buffer(dir, flags, DEFAULT_BUFFER_SIZE)
    }

    /// Open a store over `dir` with an explicit initial buffer size.
    pub fn open_with_buffer(
        dir: impl AsRef<Path>,
        flags: StoreFlags,
        buffer_size: usize,
    ) -> StoreResult<Self> {
        if buffer_size == 0 || buffer_size > MAX_BUFFER_SIZE {
            return Err(StoreError::Config {
                reason: format!("buffer size {} outside 1..={}", buffer_size, MAX_BUFFER_SIZE),
            });
        }
        if !V::empty().is_empty() {
            return Err(StoreError::Config {
                reason: "value type's empty value reports itself non-empty".into(),
            });
        }

        let mut store = Store {
            objects: M::default(),
            writer: FrameWriter::new(buffer_size, MAX_BUFFER_SIZE),
            events: None,
            dir: PathBuf::new(),
            flags,
            generation: 0,
            loaded: false,
            #[cfg(unix)]
            children: Vec::new(),
            _kv: PhantomData,
        };
        store.set_directory(dir)?;
        Ok(store)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The in-memory map. Mutations through [`Store::objects_mut`] bypass
    /// the event log; use [`Store::persist`] to log them afterwards.
    pub fn objects(&self) -> &M {
        &self.objects
    }

    /// Mutable access to the in-memory map, without logging.
    pub fn objects_mut(&mut self) -> &mut M {
        &mut self.objects
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.objects.get(key)
    }

    /// Mutable access to one value, without logging. Follow up with
    /// [`Store::persist`] to record the new state.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.objects.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The generation of the newest persisted lineage.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn buffer_size(&self) -> usize {
        self.writer.capacity()
    }

    /// Bytes buffered but not yet emitted as a frame.
    pub fn pending_bytes(&self) -> usize {
        self.writer.pending()
    }

    /// Bytes a record may occupy without forcing a frame boundary. To make
    /// a sequence of mutations replay atomically, `flush()` first and keep
    /// the sequence within this capacity: it then lands in a single frame.
    pub fn remaining_capacity(&self) -> usize {
        self.writer.remaining()
    }

    /// Protect every frame with CRC32C regardless of payload size.
    pub fn set_force_crc32(&mut self, on: bool) {
        self.writer.force_crc32 = on;
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Set `key` to `value`, recording the change in the event log first.
    ///
    /// An empty `value` is accepted and recorded as a deletion: the key
    /// holds the empty value in memory until the next reload drops it.
    pub fn update(&mut self, key: K, value: V) -> StoreResult<()> {
        self.ensure_events_open()?;
        let log = self.events.as_mut().ok_or(StoreError::NotLoaded)?;
        self.writer.write_record(&mut log.file, &log.path, &key)?;
        self.writer.write_record(&mut log.file, &log.path, &value)?;
        self.objects.insert(key, value);
        Ok(())
    }

    /// Remove `key`, recording a tombstone in the event log first.
    /// Removing an absent key is a no-op. Returns whether the key existed.
    pub fn erase(&mut self, key: &K) -> StoreResult<bool> {
        if !self.objects.contains_key(key) {
            // Still report NotLoaded on a deferred-load store.
            if !self.loaded {
                return Err(StoreError::NotLoaded);
            }
            return Ok(false);
        }
        self.ensure_events_open()?;
        let log = self.events.as_mut().ok_or(StoreError::NotLoaded)?;
        self.writer.write_record(&mut log.file, &log.path, key)?;
        self.writer.write_record(&mut log.file, &log.path, &V::empty())?;
        self.objects.remove(key);
        Ok(true)
    }

    /// Log the current in-memory value under `key`, or a tombstone if the
    /// key is absent. This is how direct mutations made through
    /// [`Store::objects_mut`] become durable.
    pub fn persist(&mut self, key: &K) -> StoreResult<()> {
        self.ensure_events_open()?;
        let log = self.events.as_mut().ok_or(StoreError::NotLoaded)?;
        self.writer.write_record(&mut log.file, &log.path, key)?;
        match self.objects.get(key) {
            Some(value) => self.writer.write_record(&mut log.file, &log.path, value)?,
            None => self.writer.write_record(&mut log.file, &log.path, &V::empty())?,
        };
        Ok(())
    }

    /// Emit any buffered records as a frame. With `sync`, also commit the
    /// events file to persistent storage.
    pub fn flush(&mut self, sync: bool) -> StoreResult<()> {
        if !self.loaded {
            return Err(StoreError::NotLoaded);
        }
        if self.writer.pending() > 0 {
            self.ensure_events_open()?;
        }
        if let Some(log) = self.events.as_mut() {
            self.writer.flush(&mut log.file, &log.path)?;
            if sync {
                durable_sync(&log.file)
                    .map_err(|e| StoreError::io(&log.path, "sync events file", e))?;
            }
        }
        Ok(())
    }

    /// Empty the map and collapse history into a fresh (empty) snapshot.
    pub fn clear(&mut self) -> StoreResult<()> {
        if !self.loaded {
            return Err(StoreError::NotLoaded);
        }
        self.objects.clear();
        self.save(SaveMode::Sync)?;
        Ok(())
    }

    /// Flush any pending frame, then resize the frame buffer.
    pub fn set_buffer_size(&mut self, size: usize) -> StoreResult<()> {
        if size == 0 || size > MAX_BUFFER_SIZE {
            return Err(StoreError::Config {
                reason: format!("buffer size {} outside 1..={}", size, MAX_BUFFER_SIZE),
            });
        }
        if self.writer.pending() > 0 {
            self.flush(false)?;
        }
        self.writer.resize(size);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory lifecycle
    // ------------------------------------------------------------------

    /// Point the store at a data directory, applying the open flags:
    /// wipe-and-load under `delete_data`, plain load unless `defer_load`,
    /// create-then-load under `create_dir` when the directory is missing.
    pub fn set_directory(&mut self, dir: impl AsRef<Path>) -> StoreResult<()> {
        let dir = dir.as_ref();
        if dir == self.dir {
            return Ok(());
        }
        let exists = dir.exists();
        if exists && !dir.is_dir() {
            return Err(StoreError::PathNotDirectory {
                path: dir.to_path_buf(),
            });
        }
        if exists {
            if self.loaded {
                self.flush(false)?;
            }
            self.close_events();
            self.dir = dir.to_path_buf();
            if self.flags.delete_data {
                self.delete_data_files()?;
                self.load()?;
            } else if !self.flags.defer_load {
                self.load()?;
            } else {
                self.loaded = false;
            }
        } else if self.flags.create_dir {
            fs::create_dir_all(dir).map_err(|e| StoreError::DirectoryCreate {
                path: dir.to_path_buf(),
                message: e.to_string(),
            })?;
            self.close_events();
            self.dir = dir.to_path_buf();
            self.load()?;
        } else {
            return Err(StoreError::DirectoryMissing {
                path: dir.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Rebuild the map from the directory, discarding any current state.
    ///
    /// Restores the newest snapshot, then replays every event log with a
    /// generation at or after it, ascending. Corrupt event logs are
    /// unlinked, the surviving state is re-snapshotted, and `Ok(false)` is
    /// returned; a corrupt snapshot is fatal.
    pub fn load(&mut self) -> StoreResult<bool> {
        self.writer.discard();
        self.close_events();
        self.objects.clear();
        self.generation = 0;
        self.loaded = false;

        let mut snapshots: Vec<(u64, PathBuf)> = Vec::new();
        let mut event_logs: Vec<(u64, PathBuf)> = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io(&self.dir, "scan data directory", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, "scan data directory", e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match parse_generation(&path) {
                Some((generation, true)) => snapshots.push((generation, path)),
                Some((generation, false)) => event_logs.push((generation, path)),
                None => {}
            }
        }

        let start = match snapshots.into_iter().max_by_key(|&(generation, _)| generation) {
            Some((generation, path)) => {
                let mut reader = FrameReader::open(&path)?;
                let replayed = {
                    let _guard = EncodeContext::enter_snapshot();
                    self.replay(&mut reader)
                };
                if let Err(err) = replayed {
                    return Err(StoreError::CorruptSnapshot {
                        path,
                        reason: err.to_string(),
                    });
                }
                self.generation = generation;
                generation
            }
            None => 0,
        };

        event_logs.retain(|&(generation, _)| generation >= start);
        event_logs.sort_by_key(|&(generation, _)| generation);

        let mut corrupted = false;
        let mut expected = start;
        for (generation, path) in event_logs {
            if generation != expected {
                warn!(generation, expected, "event log lineage has a gap or overlap");
                corrupted = true;
            }
            let mut reader = FrameReader::open(&path)?;
            match self.replay(&mut reader) {
                Ok(()) => {
                    self.generation = generation;
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "removing corrupt event log");
                    let _ = fs::remove_file(&path);
                    corrupted = true;
                }
            }
            expected = generation + 1;
        }

        self.loaded = true;
        debug!(
            entries = self.objects.len(),
            generation = self.generation,
            "replayed persisted state"
        );
        if corrupted {
            // Collapse the survivors into a clean lineage so the next start
            // replays nothing questionable.
            self.save(SaveMode::Sync)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Write a snapshot of the current map at `generation + 1`, make it the
    /// store's lineage, and remove superseded files.
    ///
    /// Returns the child process id for [`SaveMode::Fork`], `None` for the
    /// other modes.
    pub fn save(&mut self, mode: SaveMode) -> StoreResult<Option<i32>> {
        if !self.loaded {
            return Err(StoreError::NotLoaded);
        }
        #[cfg(unix)]
        self.reap_children();

        // A snapshot captures the whole map; records still buffered are
        // superseded by it.
        self.writer.discard();
        self.close_events();

        let target = self.generation + 1;

        #[cfg(unix)]
        if mode == SaveMode::Fork {
            return self.fork_save(target);
        }

        if let Err(err) = self.write_snapshot(target) {
            // Stay usable at the prior generation; the next write recreates
            // the events file.
            self.writer.discard();
            return Err(err);
        }
        self.generation = target;
        self.cleanup_obsolete(target, mode == SaveMode::Sync);
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn close_events(&mut self) {
        self.events = None;
    }

    /// The events file is created on first use, so a freshly saved or
    /// loaded directory holds only the files its state requires.
    fn ensure_events_open(&mut self) -> StoreResult<()> {
        if !self.loaded {
            return Err(StoreError::NotLoaded);
        }
        if self.events.is_none() {
            let path = self.dir.join(generation_file_name(self.generation, EVENTS_EXT));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StoreError::io(&path, "open events file for append", e))?;
            self.events = Some(LogFile { file, path });
        }
        Ok(())
    }

    fn delete_data_files(&self) -> StoreResult<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io(&self.dir, "scan data directory", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, "scan data directory", e))?;
            let path = entry.path();
            if path.is_file() && parse_generation(&path).is_some() {
                fs::remove_file(&path)
                    .map_err(|e| StoreError::io(&path, "delete existing data file", e))?;
            }
        }
        Ok(())
    }

    /// Apply one file's frames to the map. Records are decoded as key then
    /// value; an empty value erases. A pair may straddle a frame boundary,
    /// but a single record never does: the writer emits the pending frame
    /// before a record that would not fit.
    fn replay(&mut self, reader: &mut FrameReader) -> StoreResult<()> {
        let mut payload = Vec::new();
        let mut offset = 0usize;
        let mut pending_key: Option<K> = None;
        loop {
            if offset == payload.len() {
                payload.clear();
                offset = 0;
                if !reader.next_frame(&mut payload)? {
                    break;
                }
                continue;
            }
            let window = &payload[offset..];
            match pending_key.take() {
                None => {
                    let mut key = K::empty();
                    let used = key.read(window)?;
                    if used > window.len() {
                        return Err(StoreError::FrameCorrupt {
                            path: reader.path().to_path_buf(),
                            offset: reader.offset(),
                            reason: "key record extends past its frame".into(),
                        });
                    }
                    offset += used;
                    pending_key = Some(key);
                }
                Some(key) => {
                    // Decode onto the current value so event records that
                    // carry a partial member list update it in place.
                    let mut value = match self.objects.remove(&key) {
                        Some(existing) => existing,
                        None => V::empty(),
                    };
                    let used = value.read(window)?;
                    if used > window.len() {
                        return Err(StoreError::FrameCorrupt {
                            path: reader.path().to_path_buf(),
                            offset: reader.offset(),
                            reason: "value record extends past its frame".into(),
                        });
                    }
                    offset += used;
                    if !value.is_empty() {
                        self.objects.insert(key, value);
                    }
                }
            }
        }
        if pending_key.is_some() {
            return Err(StoreError::FrameCorrupt {
                path: reader.path().to_path_buf(),
                offset: reader.offset(),
                reason: "file ends between a key and its value".into(),
            });
        }
        Ok(())
    }

    fn write_snapshot(&mut self, target: u64) -> StoreResult<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let tmp = self.dir.join(format!(
            "tmp_snapshot_{}_{}_{}",
            std::process::id(),
            nanos,
            target
        ));
        if let Err(err) = self.write_snapshot_file(&tmp, target) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        Ok(())
    }

    fn write_snapshot_file(&mut self, tmp: &Path, target: u64) -> StoreResult<()> {
        let mut file =
            File::create(tmp).map_err(|e| StoreError::io(tmp, "create snapshot temp file", e))?;
        {
            let _guard = EncodeContext::enter_snapshot();
            for (key, value) in self.objects.iter() {
                // Empty values are deletion sentinels; snapshots hold live
                // entries only.
                if value.is_empty() {
                    continue;
                }
                self.writer.write_record(&mut file, tmp, key)?;
                self.writer.write_record(&mut file, tmp, value)?;
            }
            self.writer.flush(&mut file, tmp)?;
        }
        durable_sync(&file).map_err(|e| StoreError::io(tmp, "sync snapshot temp file", e))?;
        drop(file);

        let final_path = self.dir.join(generation_file_name(target, SNAPSHOT_EXT));
        fs::rename(tmp, &final_path)
            .map_err(|e| StoreError::io(tmp, "rename snapshot into place", e))?;
        Ok(())
    }

    /// Remove every event log and snapshot older than `keep`. Failures are
    /// swallowed: a stale file must not block forward progress.
    fn cleanup_obsolete(&self, keep: u64, sync: bool) {
        let mut doomed: Vec<PathBuf> = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                if let Some((generation, _)) = parse_generation(&path) {
                    if generation < keep {
                        doomed.push(path);
                    }
                }
            }
        }
        if doomed.is_empty() {
            return;
        }
        if sync {
            remove_files(&doomed);
        } else {
            // The task owns its path list outright; the store may be
            // dropped before it runs.
            std::thread::spawn(move || remove_files(&doomed));
        }
    }

    #[cfg(unix)]
    fn fork_save(&mut self, target: u64) -> StoreResult<Option<i32>> {
        // SAFETY: the child touches only its copy-on-write memory and file
        // descriptors it opens itself, and leaves via _exit.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                let err = std::io::Error::last_os_error();
                Err(StoreError::io(&self.dir, "fork snapshot child", err))
            }
            0 => {
                let code = match self.write_snapshot(target) {
                    Ok(()) => {
                        self.cleanup_obsolete(target, true);
                        0
                    }
                    Err(_) => 1,
                };
                // SAFETY: terminate the child without running the parent's
                // atexit handlers or destructors.
                unsafe { libc::_exit(code) }
            }
            child => {
                self.generation = target;
                self.children.push(child);
                Ok(Some(child))
            }
        }
    }

    /// Collect finished snapshot children without blocking.
    #[cfg(unix)]
    fn reap_children(&mut self) {
        self.children.retain(|&pid| {
            let mut status = 0;
            // SAFETY: WNOHANG waitpid on a child this process spawned.
            unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) == 0 }
        });
    }
}
