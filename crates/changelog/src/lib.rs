//! Durable, rotating store of replicated log entries.
//!
//! Entries live in `changelog_<from>_<to>.bin[.zstd]` files, each intended
//! to hold one rotation interval. All entries from `start_index` on are
//! mirrored in an in-memory map, so reads never touch the disk and never
//! observe a half-written record. Appends go to the active file; an fsync
//! worker publishes `last_durable_index` behind the writer.
//!
//! # Recovery
//!
//! `init` scans the directory and tolerates what a crash can leave behind:
//! a torn tail record (the file is cut back to its intact prefix), a
//! zero-length file (treated as corruption), or a missing file in the middle
//! of the range. Whatever lies past the first damage cannot be trusted to
//! be contiguous, so those files are moved to `detached/<timestamp>/`
//! rather than deleted.
//!
//! # Example
//!
//! ```no_run
//! use changelog::{Changelog, LogEntry, LogFileSettings};
//!
//! let settings = LogFileSettings::builder().rotate_interval(5).build();
//! let mut log = Changelog::new("./logs", settings).unwrap();
//! log.init(1, 0).unwrap();
//! log.append(LogEntry::new(77, "hello world")).unwrap();
//! log.end_of_append_batch(0, 0).unwrap();
//! while log.last_durable_index() + 1 != log.next_slot() {
//!     std::thread::yield_now();
//! }
//! ```

mod entry;
mod frame;


pub use entry::{EntryKind, LogEntry};
pub use frame::FileDescription;

use bincode::config::{self, Config};
use common::{CoordinationError, CoordinationResult};
use frame::{record_size, FileReadResult, RecordWriter};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Shared serde configuration: little-endian, fixed-width integers.
fn bincode_config() -> impl Config {
    config::legacy()
}

/// Knobs of the on-disk log.
///
/// # Example
/// ```
/// use changelog::LogFileSettings;
///
/// let settings = LogFileSettings::builder()
///     .compress(true)
///     .rotate_interval(20)
///     .build();
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct LogFileSettings {
    /// fsync at every batch boundary before advancing the durable index.
    #[builder(default = true)]
    pub force_sync: bool,
    /// Write new files through the zstd streaming codec.
    #[builder(default = false)]
    pub compress: bool,
    /// Entries per file.
    #[builder(default = 100_000)]
    pub rotate_interval: u64,
    /// Rotate early once a file would exceed this many bytes; 0 disables.
    #[builder(default = 0)]
    pub max_size: u64,
}

impl Default for LogFileSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

enum FlushOp {
    /// fsync `file`, then publish `up_to`.
    Sync { file: File, up_to: u64 },
    /// Publish `up_to` without touching the disk.
    Advance { up_to: u64 },
    Shutdown,
}

struct ActiveFile {
    desc: FileDescription,
    writer: RecordWriter,
    sync_handle: File,
    /// Entries the file holds, counted from `desc.from`.
    entries: u64,
    /// Uncompressed record bytes, the size estimate rotation works with.
    bytes: u64,
}

impl ActiveFile {
    fn create(desc: FileDescription) -> CoordinationResult<Self> {
        let writer = RecordWriter::open(&desc, true)
            .map_err(|e| CoordinationError::Changelog(format!("create {:?}: {e}", desc.path)))?;
        let sync_handle = File::open(&desc.path)
            .map_err(|e| CoordinationError::Changelog(format!("open {:?}: {e}", desc.path)))?;
        Ok(Self {
            desc,
            writer,
            sync_handle,
            entries: 0,
            bytes: 0,
        })
    }

    fn reopen(desc: FileDescription, entries: u64, bytes: u64) -> CoordinationResult<Self> {
        let writer = RecordWriter::open(&desc, false)
            .map_err(|e| CoordinationError::Changelog(format!("reopen {:?}: {e}", desc.path)))?;
        let sync_handle = File::open(&desc.path)
            .map_err(|e| CoordinationError::Changelog(format!("open {:?}: {e}", desc.path)))?;
        Ok(Self {
            desc,
            writer,
            sync_handle,
            entries,
            bytes,
        })
    }

    fn last_index(&self) -> u64 {
        self.desc.from + self.entries - 1
    }
}

/// The change log. Writes are serialized by the owning state-machine
/// thread; `last_durable_index` may be polled from anywhere.
pub struct Changelog {
    log_dir: PathBuf,
    settings: LogFileSettings,
    /// Contiguous entries `start_index..next_slot`.
    entries: BTreeMap<u64, LogEntry>,
    /// On-disk files keyed by their first index; includes the active file.
    files: BTreeMap<u64, FileDescription>,
    active: Option<ActiveFile>,
    start_index: u64,
    next_slot: u64,
    durable_index: Arc<AtomicU64>,
    flush_tx: Sender<FlushOp>,
    flush_worker: Option<JoinHandle<()>>,
    initialized: bool,
}

impl Changelog {
    pub fn new(log_dir: impl AsRef<Path>, settings: LogFileSettings) -> CoordinationResult<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;

        let durable_index = Arc::new(AtomicU64::new(0));
        let (flush_tx, flush_rx) = mpsc::channel::<FlushOp>();
        let worker_durable = Arc::clone(&durable_index);
        let flush_worker = std::thread::Builder::new()
            .name("changelog-flush".into())
            .spawn(move || {
                while let Ok(op) = flush_rx.recv() {
                    match op {
                        FlushOp::Sync { file, up_to } => {
                            let mut attempt = 0;
                            loop {
                                match file.sync_data() {
                                    Ok(()) => {
                                        worker_durable.store(up_to, Ordering::Release);
                                        break;
                                    }
                                    Err(e) if attempt < 5 => {
                                        attempt += 1;
                                        warn!(error = %e, attempt, "changelog fsync failed, retrying");
                                        std::thread::sleep(Duration::from_millis(100));
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "changelog fsync gave up; durable index held back");
                                        break;
                                    }
                                }
                            }
                        }
                        FlushOp::Advance { up_to } => {
                            worker_durable.store(up_to, Ordering::Release)
                        }
                        FlushOp::Shutdown => break,
                    }
                }
            })
            .map_err(|e| CoordinationError::Changelog(format!("spawn flush worker: {e}")))?;

        Ok(Self {
            log_dir,
            settings,
            entries: BTreeMap::new(),
            files: BTreeMap::new(),
            active: None,
            start_index: 1,
            next_slot: 1,
            durable_index,
            flush_tx,
            flush_worker: Some(flush_worker),
            initialized: false,
        })
    }

    /// Scans the log directory and recovers the entries the consensus layer
    /// can still ask for: everything from `start_index` on, plus up to
    /// `reserved` older entries kept behind it for peers that lag.
    pub fn init(&mut self, start_index: u64, reserved: u64) -> CoordinationResult<()> {
        let requested = start_index.max(1);
        let keep_from = requested.saturating_sub(reserved).max(1);
        self.start_index = keep_from;
        self.next_slot = requested;
        self.entries.clear();
        self.files.clear();
        self.active = None;

        let mut discovered = self.scan_directory()?;
        let mut quarantine: Vec<FileDescription> = Vec::new();

        // Overlapping ranges (one compressed, one not) can survive a crash
        // during a rewrite; keep the file that reaches further.
        discovered.sort_by(|a, b| a.from.cmp(&b.from).then(b.to.cmp(&a.to)));
        let mut files: Vec<FileDescription> = Vec::new();
        for desc in discovered {
            match files.last() {
                Some(prev) if prev.from == desc.from => quarantine.push(desc),
                _ => files.push(desc),
            }
        }

        let mut expected_next = keep_from;
        let mut last_read: Option<u64> = None;
        let mut broken_boundary: Option<u64> = None;

        let mut iter = files.into_iter().peekable();
        while let Some(desc) = iter.next() {
            if desc.from > expected_next {
                warn!(
                    file = ?desc.path,
                    expected = expected_next,
                    "gap in changelog files, quarantining the rest"
                );
                quarantine.push(desc);
                quarantine.extend(iter);
                break;
            }

            let FileReadResult { entries, error } = frame::read_file(&desc)
                .map_err(|e| CoordinationError::Changelog(format!("read {:?}: {e}", desc.path)))?;

            if error.is_some() || entries.is_empty() {
                if let Some(e) = &error {
                    warn!(file = ?desc.path, error = %e, read = entries.len(), "broken changelog file");
                } else {
                    warn!(file = ?desc.path, "empty changelog file treated as broken");
                }
                let next_index = entries
                    .last()
                    .map(|(i, _)| i + 1)
                    .unwrap_or_else(|| last_read.map_or(expected_next, |l| l + 1));
                if entries.is_empty() {
                    fs::remove_file(&desc.path)?;
                } else {
                    frame::rewrite_file(&desc, entries.iter().map(|(i, e)| (*i, e)))?;
                    self.files.insert(desc.from, desc);
                }
                for (index, entry) in entries {
                    last_read = Some(index);
                    if index >= keep_from {
                        self.entries.insert(index, entry);
                    }
                }
                quarantine.extend(iter);
                broken_boundary = Some(next_index);
                break;
            }

            for (index, entry) in entries {
                last_read = Some(index);
                expected_next = expected_next.max(index + 1);
                if index >= keep_from {
                    self.entries.insert(index, entry);
                }
            }
            self.files.insert(desc.from, desc);
        }

        if !quarantine.is_empty() {
            self.quarantine_files(&quarantine)?;
        }

        match last_read {
            Some(last) if last + 1 >= keep_from => {
                self.next_slot = last + 1;
            }
            Some(last) => {
                // Everything on disk predates the requested start; the
                // consensus layer has moved past these logs entirely.
                info!(
                    last,
                    requested, "changelog ends before requested start, discarding files"
                );
                self.entries.clear();
                for desc in self.files.values() {
                    fs::remove_file(&desc.path)?;
                }
                self.files.clear();
                self.start_index = requested;
                self.next_slot = requested;
            }
            None => {
                self.start_index = requested;
                self.next_slot = requested;
            }
        }

        if let Some(boundary) = broken_boundary {
            if boundary == self.next_slot {
                // Resume into a fresh file right away so the damaged one is
                // never appended to again.
                let desc = FileDescription::new(
                    &self.log_dir,
                    self.next_slot,
                    self.next_slot + self.settings.rotate_interval - 1,
                    self.settings.compress,
                );
                let active = ActiveFile::create(desc.clone())?;
                self.files.insert(desc.from, desc);
                self.active = Some(active);
            }
        } else if let Some((&from, desc)) = self.files.iter().next_back() {
            // A tail file is only appended to when it still has room and
            // matches the configured format; otherwise the next append
            // rotates into a fresh file.
            if self.next_slot <= desc.to && desc.compressed == self.settings.compress {
                let entries_in_file = self.next_slot - from;
                let bytes = self
                    .entries
                    .range(from..)
                    .map(|(_, e)| record_size(e))
                    .sum();
                self.active = Some(ActiveFile::reopen(desc.clone(), entries_in_file, bytes)?);
            }
        }

        self.durable_index
            .store(self.next_slot.saturating_sub(1), Ordering::Release);
        self.initialized = true;
        Ok(())
    }

    /// Appends an entry, assigning it the next slot. Durability is deferred
    /// to `end_of_append_batch`.
    pub fn append(&mut self, entry: LogEntry) -> CoordinationResult<u64> {
        debug_assert!(self.initialized, "append before init");
        let index = self.next_slot;

        if let Some(active) = &self.active {
            let over_interval = index > active.desc.to;
            let over_size = self.settings.max_size > 0
                && active.entries > 0
                && active.bytes + record_size(&entry) > self.settings.max_size;
            if over_interval || over_size {
                self.finalize_active()?;
            }
        }

        if self.active.is_none() {
            let desc = FileDescription::new(
                &self.log_dir,
                index,
                index + self.settings.rotate_interval - 1,
                self.settings.compress,
            );
            self.files.insert(desc.from, desc.clone());
            self.active = Some(ActiveFile::create(desc)?);
        }

        let active = self.active.as_mut().expect("active file just ensured");
        active
            .writer
            .write_record(index, &entry)
            .map_err(|e| CoordinationError::Changelog(format!("append entry {index}: {e}")))?;
        active.entries += 1;
        active.bytes += record_size(&entry);

        self.entries.insert(index, entry);
        self.next_slot += 1;
        Ok(index)
    }

    /// Batch boundary: makes everything appended so far decodable and
    /// schedules the fsync that will advance `last_durable_index`.
    pub fn end_of_append_batch(&mut self, _start: u64, _count: u64) -> CoordinationResult<()> {
        let up_to = self.next_slot - 1;
        if let Some(active) = &mut self.active {
            active
                .writer
                .flush_batch()
                .map_err(|e| CoordinationError::Changelog(format!("flush batch: {e}")))?;
            if self.settings.force_sync {
                let file = active.sync_handle.try_clone().map_err(|e| {
                    CoordinationError::Changelog(format!("clone sync handle: {e}"))
                })?;
                let _ = self.flush_tx.send(FlushOp::Sync { file, up_to });
                return Ok(());
            }
        }
        let _ = self.flush_tx.send(FlushOp::Advance { up_to });
        Ok(())
    }

    /// Index of the last entry known to be durable on disk.
    pub fn last_durable_index(&self) -> u64 {
        self.durable_index.load(Ordering::Acquire)
    }

    /// Overwrites the suffix starting at `index` with a single entry:
    /// `next_slot` becomes `index + 1`.
    pub fn write_at(&mut self, index: u64, entry: LogEntry) -> CoordinationResult<u64> {
        if index < self.next_slot {
            self.truncate_to(index)?;
        }
        self.append(entry)
    }

    /// Forgets all entries up to and including `up_to_index` and deletes the
    /// files that hold nothing newer. A file straddling the boundary stays.
    pub fn compact(&mut self, up_to_index: u64) -> CoordinationResult<()> {
        if up_to_index < self.start_index {
            return Ok(());
        }

        if up_to_index >= self.next_slot.saturating_sub(1) {
            if let Some(active) = self.active.take() {
                let _ = active.writer.finalize();
            }
            for desc in self.files.values() {
                fs::remove_file(&desc.path)?;
            }
            self.files.clear();
            self.entries.clear();
            self.start_index = up_to_index + 1;
            self.next_slot = up_to_index + 1;
            self.durable_index.store(up_to_index, Ordering::Release);
            return Ok(());
        }

        self.start_index = up_to_index + 1;
        self.entries = self.entries.split_off(&(up_to_index + 1));

        let froms: Vec<u64> = self.files.keys().copied().collect();
        for (position, &from) in froms.iter().enumerate() {
            let effective_last = froms
                .get(position + 1)
                .map(|next_from| next_from - 1)
                .unwrap_or(self.next_slot - 1);
            if effective_last <= up_to_index {
                let desc = self.files.remove(&from).expect("file present");
                info!(file = ?desc.path, "removing compacted changelog file");
                fs::remove_file(&desc.path)?;
            }
        }
        Ok(())
    }

    /// Serializes `count` entries starting at `from` for snapshot-install
    /// transfer to a peer.
    pub fn pack(&self, from: u64, count: u64) -> CoordinationResult<Vec<u8>> {
        let mut packed = Vec::with_capacity(count as usize);
        for index in from..from + count {
            let entry = self.entries.get(&index).ok_or_else(|| {
                CoordinationError::Changelog(format!("pack: entry {index} not in log"))
            })?;
            packed.push(entry.clone());
        }
        bincode::serde::encode_to_vec(&packed, bincode_config())
            .map_err(|e| CoordinationError::Changelog(format!("pack encode: {e}")))
    }

    /// Replaces everything from `start` on with the packed entries.
    pub fn apply_pack(&mut self, start: u64, blob: &[u8]) -> CoordinationResult<()> {
        let (packed, _): (Vec<LogEntry>, usize) =
            bincode::serde::decode_from_slice(blob, bincode_config())
                .map_err(|e| CoordinationError::Changelog(format!("pack decode: {e}")))?;

        if self.size() > 0 && start < self.next_slot {
            self.truncate_to(start)?;
        }
        if self.size() == 0 {
            self.start_index = start;
            self.next_slot = start;
            self.durable_index
                .store(start.saturating_sub(1), Ordering::Release);
        }
        for entry in packed {
            self.append(entry)?;
        }
        Ok(())
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(&index)
    }

    pub fn last_entry(&self) -> Option<&LogEntry> {
        self.entries.values().next_back()
    }

    /// Entries in `[from, to_exclusive)`, cloned out of the cache.
    pub fn log_entries(&self, from: u64, to_exclusive: u64) -> Vec<LogEntry> {
        self.entries
            .range(from..to_exclusive)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn next_slot(&self) -> u64 {
        self.next_slot
    }

    fn scan_directory(&self) -> CoordinationResult<Vec<FileDescription>> {
        let mut found = Vec::new();
        for dir_entry in fs::read_dir(&self.log_dir)? {
            let path = dir_entry?.path();
            if path.is_file() {
                if let Some(desc) = FileDescription::parse(&path) {
                    found.push(desc);
                }
            }
        }
        Ok(found)
    }

    fn quarantine_files(&mut self, files: &[FileDescription]) -> CoordinationResult<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let detached = self.log_dir.join("detached").join(timestamp.to_string());
        fs::create_dir_all(&detached)?;
        for desc in files {
            let target = detached.join(desc.path.file_name().expect("file has a name"));
            warn!(file = ?desc.path, to = ?target, "quarantining changelog file");
            fs::rename(&desc.path, &target)?;
            self.files.remove(&desc.from);
        }
        Ok(())
    }

    fn finalize_active(&mut self) -> CoordinationResult<()> {
        if let Some(active) = self.active.take() {
            let last_index = active.last_index();
            let ActiveFile {
                writer,
                sync_handle,
                ..
            } = active;
            writer
                .finalize()
                .map_err(|e| CoordinationError::Changelog(format!("close on rotation: {e}")))?;
            if self.settings.force_sync {
                let _ = self.flush_tx.send(FlushOp::Sync {
                    file: sync_handle,
                    up_to: last_index,
                });
            }
        }
        Ok(())
    }

    /// Drops every entry at `index` and beyond: deletes files wholly past
    /// the boundary and rewrites the one straddling it.
    fn truncate_to(&mut self, index: u64) -> CoordinationResult<()> {
        let old_last = self.next_slot - 1;
        if let Some(active) = self.active.take() {
            let _ = active.writer.finalize();
        }

        if index <= self.start_index {
            for desc in self.files.values() {
                fs::remove_file(&desc.path)?;
            }
            self.files.clear();
            self.entries.clear();
            self.start_index = index;
            self.next_slot = index;
            self.durable_index
                .store(index.saturating_sub(1), Ordering::Release);
            return Ok(());
        }

        let _ = self.entries.split_off(&index);

        let doomed: Vec<u64> = self.files.range(index..).map(|(k, _)| *k).collect();
        for from in doomed {
            let desc = self.files.remove(&from).expect("file present");
            fs::remove_file(&desc.path)?;
        }

        if let Some((&from, desc)) = self.files.iter().next_back() {
            let desc = desc.clone();
            let keep_from = from.max(self.start_index);
            if old_last.min(desc.to) >= index {
                frame::rewrite_file(&desc, self.entries.range(keep_from..index).map(|(i, e)| (*i, e)))
                    .map_err(|e| {
                        CoordinationError::Changelog(format!("rewrite {:?}: {e}", desc.path))
                    })?;
            }
            if index <= desc.to {
                let entries_in_file = index - from;
                let bytes = self
                    .entries
                    .range(keep_from..index)
                    .map(|(_, e)| record_size(e))
                    .sum();
                self.active = Some(ActiveFile::reopen(desc, entries_in_file, bytes)?);
            }
        }

        self.next_slot = index;
        let durable = self.durable_index.load(Ordering::Acquire);
        self.durable_index
            .store(durable.min(index.saturating_sub(1)), Ordering::Release);
        Ok(())
    }
}

impl Drop for Changelog {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.writer.finalize();
        }
        let _ = self.flush_tx.send(FlushOp::Shutdown);
        if let Some(worker) = self.flush_worker.take() {
            let _ = worker.join();
        }
    }
}
