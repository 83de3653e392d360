//! Flash-backed persistent storage.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/
//! ├── identity.json              - credential and remembered network
//! └── buffer/
//!     ├── 00000000000000000001.evt
//!     ├── 00000000000000000002.evt
//!     └── 00000000000000000003.tmp   (torn write, removed by compaction)
//! ```
//!
//! Every buffered event is its own file, written to a `.tmp` sibling, synced
//! and renamed into place. Each file is a single frame:
//!
//! ```text
//! "TAPN" | payload length (u32 LE) | CRC-32 of payload (u32 LE) | JSON payload
//! ```
//!
//! A power cut mid-write leaves at worst a `.tmp` file or a frame that fails
//! validation; neighboring entries are never touched.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::BusLock;
use crate::config::OverflowPolicy;
use crate::types::ScanEvent;

const FRAME_MAGIC: &[u8; 4] = b"TAPN";
const FRAME_HEADER_LEN: usize = 12;
const ENTRY_EXT: &str = "evt";
const TEMP_EXT: &str = "tmp";
const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Errors from the flash-backed store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A filesystem operation failed.
    #[error("{}: {source}", .path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stored frame failed validation.
    #[error("corrupt entry {}: {reason}", .path.display())]
    Corrupt {
        /// File holding the entry.
        path: PathBuf,
        /// What failed to validate.
        reason: String,
    },

    /// A record could not be serialized.
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Storage root for reader data.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a storage root at `data_dir`.
    #[must_use]
    pub const fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Get the default storage location.
    ///
    /// On readers: `/var/lib/tapin/`
    /// For development: the platform data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory can be determined.
    pub fn platform_default() -> StorageResult<Self> {
        #[cfg(target_os = "linux")]
        {
            Ok(Self::new(PathBuf::from("/var/lib/tapin")))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "tapin").ok_or_else(|| {
                StorageError::Io {
                    path: PathBuf::from("tapin"),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "cannot determine data directory",
                    ),
                }
            })?;
            Ok(Self::new(dirs.data_dir().to_path_buf()))
        }
    }

    /// Root directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding buffered events.
    #[must_use]
    pub fn buffer_dir(&self) -> PathBuf {
        self.data_dir.join("buffer")
    }

    /// Path of the identity record.
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }
}

/// Write `bytes` to `path` via a synced temp file and rename.
pub(crate) fn write_atomic(path: &Path, temp: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut file = fs::File::create(temp).map_err(io_err(temp))?;
    file.write_all(bytes).map_err(io_err(temp))?;
    file.sync_all().map_err(io_err(temp))?;
    drop(file);
    fs::rename(temp, path).map_err(io_err(path))
}

fn checksum(bytes: &[u8]) -> u32 {
    FRAME_CRC.checksum(bytes)
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(FRAME_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&checksum(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn decode_frame(frame: &[u8]) -> Result<&[u8], String> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(format!("short frame ({} bytes)", frame.len()));
    }
    if &frame[..4] != FRAME_MAGIC {
        return Err("bad magic".to_string());
    }
    let len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let expected = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
    let payload = &frame[FRAME_HEADER_LEN..];
    if payload.len() != len {
        return Err(format!("length {} != header {len}", payload.len()));
    }
    if checksum(payload) != expected {
        return Err("checksum mismatch".to_string());
    }
    Ok(payload)
}

#[derive(Serialize, Deserialize)]
struct EntryRecord {
    version: u8,
    event: ScanEvent,
}

/// A buffered event together with its position in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEvent {
    /// Sequence number; lower is older.
    pub id: u64,
    /// The persisted event.
    pub event: ScanEvent,
}

/// What [`EventBuffer::push`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored under the given id.
    Stored(u64),
    /// Stored after evicting the oldest entry (`evicted`).
    StoredEvictingOldest {
        /// Id of the new entry.
        id: u64,
        /// Id of the evicted entry.
        evicted: u64,
    },
    /// The buffer is full and the policy refuses new events.
    Rejected,
}

impl PushOutcome {
    /// The buffer's capacity was exceeded.
    #[must_use]
    pub const fn overflowed(self) -> bool {
        !matches!(self, Self::Stored(_))
    }
}

/// What [`EventBuffer::compact`] cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Entries that failed validation and were deleted.
    pub corrupt_dropped: u32,
    /// Leftover temp files deleted.
    pub temp_removed: u32,
}

/// Durable record of every scan not yet acknowledged by the backend.
#[derive(Debug)]
pub struct EventBuffer {
    dir: PathBuf,
    capacity: usize,
    policy: OverflowPolicy,
    next_id: u64,
    index: BTreeSet<u64>,
}

/// The event buffer behind the storage lock.
pub type SharedBuffer = Arc<BusLock<EventBuffer>>;

impl EventBuffer {
    /// Open (or create) the buffer in `dir`, indexing existing entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(
        dir: impl Into<PathBuf>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let mut index = BTreeSet::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            if let Some(id) = entry_id(&path, ENTRY_EXT) {
                index.insert(id);
            }
        }
        let next_id = index.last().map_or(1, |last| last + 1);
        info!(dir = %dir.display(), entries = index.len(), "opened event buffer");

        Ok(Self {
            dir,
            capacity,
            policy,
            next_id,
            index,
        })
    }

    /// Wrap the buffer in its storage lock.
    #[must_use]
    pub fn shared(self) -> SharedBuffer {
        Arc::new(BusLock::new("storage", self))
    }

    /// Number of entries on flash.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns `true` if entry `id` is on flash.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.index.contains(&id)
    }

    /// Capacity ceiling.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Persist `event`, applying the overflow policy at capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written; nothing is evicted
    /// in that case.
    pub fn push(&mut self, event: &ScanEvent) -> StorageResult<PushOutcome> {
        let evict = if self.index.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropNewest => {
                    warn!(
                        tag = %event.tag,
                        capacity = self.capacity,
                        "buffer full, refusing event"
                    );
                    return Ok(PushOutcome::Rejected);
                }
                OverflowPolicy::DropOldest => self.index.first().copied(),
            }
        } else {
            None
        };

        let id = self.next_id;
        let payload = serde_json::to_vec(&EntryRecord {
            version: 1,
            event: event.clone(),
        })?;
        write_atomic(
            &self.entry_path(id, ENTRY_EXT),
            &self.entry_path(id, TEMP_EXT),
            &encode_frame(&payload),
        )?;
        self.next_id += 1;
        self.index.insert(id);
        debug!(id, tag = %event.tag, depth = self.index.len(), "buffered event");

        match evict {
            Some(oldest) => {
                // The new entry is already durable; a failed eviction only
                // leaves the buffer one over its ceiling.
                if let Err(e) = self.remove(oldest) {
                    warn!(evicted = oldest, error = %e, "failed to evict oldest event");
                }
                warn!(evicted = oldest, "buffer full, evicted oldest event");
                Ok(PushOutcome::StoredEvictingOldest { id, evicted: oldest })
            }
            None => Ok(PushOutcome::Stored(id)),
        }
    }

    /// Up to `limit` of the oldest readable entries, oldest first.
    ///
    /// Entries that fail validation are skipped and left for
    /// [`compact`](Self::compact).
    #[must_use]
    pub fn oldest(&self, limit: usize) -> Vec<BufferedEvent> {
        let mut batch = Vec::with_capacity(limit.min(self.index.len()));
        for &id in &self.index {
            if batch.len() >= limit {
                break;
            }
            match self.read(id) {
                Ok(event) => batch.push(BufferedEvent { id, event }),
                Err(e) => warn!(id, error = %e, "skipping unreadable buffered event"),
            }
        }
        batch
    }

    /// Read one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or fails validation.
    pub fn read(&self, id: u64) -> StorageResult<ScanEvent> {
        let path = self.entry_path(id, ENTRY_EXT);
        let frame = fs::read(&path).map_err(io_err(&path))?;
        let payload = decode_frame(&frame).map_err(|reason| StorageError::Corrupt {
            path: path.clone(),
            reason,
        })?;
        let record: EntryRecord =
            serde_json::from_slice(payload).map_err(|e| StorageError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(record.event)
    }

    /// Delete an entry after confirmed delivery. Missing entries are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&mut self, id: u64) -> StorageResult<()> {
        let path = self.entry_path(id, ENTRY_EXT);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StorageError::Io { path, source }),
        }
        self.index.remove(&id);
        Ok(())
    }

    /// Drop corrupt entries and leftover temp files, then re-index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn compact(&mut self) -> StorageResult<CompactionReport> {
        let mut report = CompactionReport::default();
        let mut index = BTreeSet::new();

        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let path = entry.map_err(io_err(&self.dir))?.path();
            if entry_id(&path, TEMP_EXT).is_some() {
                if fs::remove_file(&path).is_ok() {
                    report.temp_removed += 1;
                }
                continue;
            }
            let Some(id) = entry_id(&path, ENTRY_EXT) else {
                continue;
            };
            match self.read(id) {
                Ok(_) => {
                    index.insert(id);
                }
                Err(e) => {
                    warn!(id, error = %e, "dropping corrupt buffered event");
                    if fs::remove_file(&path).is_ok() {
                        report.corrupt_dropped += 1;
                    } else {
                        index.insert(id);
                    }
                }
            }
        }

        self.index = index;
        if let Some(&last) = self.index.last() {
            self.next_id = self.next_id.max(last + 1);
        }
        info!(
            depth = self.index.len(),
            corrupt = report.corrupt_dropped,
            temp = report.temp_removed,
            "compacted event buffer"
        );
        Ok(report)
    }

    fn entry_path(&self, id: u64, ext: &str) -> PathBuf {
        self.dir.join(format!("{id:020}.{ext}"))
    }
}

fn entry_id(path: &Path, ext: &str) -> Option<u64> {
    if path.extension()? != ext {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IsoTimestamp;

    fn event(tag: &str) -> ScanEvent {
        ScanEvent::new(tag, IsoTimestamp::truncated("2025-01-15T08:00:00Z"), -48)
    }

    #[test]
    fn test_checksum_is_standard_crc32() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(&encode_frame(b"123456789")[8..12], &0xCBF4_3926_u32.to_le_bytes());
    }

    #[test]
    fn test_frame_rejects_tampering() {
        let frame = encode_frame(b"{\"hello\":1}");
        assert!(decode_frame(&frame).is_ok());

        let mut flipped = frame.clone();
        *flipped.last_mut().unwrap() ^= 0xFF;
        assert_eq!(decode_frame(&flipped).unwrap_err(), "checksum mismatch");

        assert!(decode_frame(&frame[..frame.len() - 3]).is_err());
        assert!(decode_frame(&frame[..5]).is_err());
    }

    #[test]
    fn test_push_and_read_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = EventBuffer::open(dir.path(), 10, OverflowPolicy::DropNewest).unwrap();

        buffer.push(&event("A")).unwrap();
        buffer.push(&event("B")).unwrap();
        buffer.push(&event("C")).unwrap();

        let tags: Vec<_> = buffer
            .oldest(2)
            .into_iter()
            .map(|b| b.event.tag.to_string())
            .collect();
        assert_eq!(tags, ["A", "B"]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_remove_after_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = EventBuffer::open(dir.path(), 10, OverflowPolicy::DropNewest).unwrap();
        let PushOutcome::Stored(id) = buffer.push(&event("A")).unwrap() else {
            panic!("expected stored");
        };

        buffer.remove(id).unwrap();
        assert!(buffer.is_empty());
        // Removing twice is harmless.
        buffer.remove(id).unwrap();
    }

    #[test]
    fn test_drop_newest_rejects_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = EventBuffer::open(dir.path(), 2, OverflowPolicy::DropNewest).unwrap();
        buffer.push(&event("A")).unwrap();
        buffer.push(&event("B")).unwrap();

        let outcome = buffer.push(&event("C")).unwrap();
        assert_eq!(outcome, PushOutcome::Rejected);
        assert!(outcome.overflowed());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_drop_oldest_evicts_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = EventBuffer::open(dir.path(), 2, OverflowPolicy::DropOldest).unwrap();
        buffer.push(&event("A")).unwrap();
        buffer.push(&event("B")).unwrap();

        let outcome = buffer.push(&event("C")).unwrap();
        assert!(matches!(outcome, PushOutcome::StoredEvictingOldest { evicted: 1, .. }));
        assert!(outcome.overflowed());

        let tags: Vec<_> = buffer
            .oldest(10)
            .into_iter()
            .map(|b| b.event.tag.to_string())
            .collect();
        assert_eq!(tags, ["B", "C"]);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut buffer =
                EventBuffer::open(dir.path(), 10, OverflowPolicy::DropNewest).unwrap();
            buffer.push(&event("A")).unwrap();
            buffer.push(&event("B")).unwrap();
        }
        let mut buffer = EventBuffer::open(dir.path(), 10, OverflowPolicy::DropNewest).unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.push(&event("C")).unwrap(), PushOutcome::Stored(3));
    }

    #[test]
    fn test_compaction_drops_corrupt_entries_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = EventBuffer::open(dir.path(), 10, OverflowPolicy::DropNewest).unwrap();
        buffer.push(&event("A")).unwrap();
        buffer.push(&event("B")).unwrap();

        std::fs::write(dir.path().join(format!("{:020}.evt", 2)), b"TAPN\x01").unwrap();
        std::fs::write(dir.path().join(format!("{:020}.tmp", 3)), b"TAP").unwrap();

        // Unreadable entries are skipped, not returned.
        assert_eq!(buffer.oldest(10).len(), 1);

        let report = buffer.compact().unwrap();
        assert_eq!(report.corrupt_dropped, 1);
        assert_eq!(report.temp_removed, 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.read(1).unwrap().tag, "A");
    }

    #[test]
    fn test_storage_paths() {
        let storage = Storage::new(PathBuf::from("/data"));
        assert_eq!(storage.buffer_dir(), PathBuf::from("/data/buffer"));
        assert_eq!(storage.identity_path(), PathBuf::from("/data/identity.json"));
    }
}
