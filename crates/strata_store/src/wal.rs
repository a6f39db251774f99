//! Per-shard write-ahead log: append-only, offset-ordered, crc-framed.
//!
//! The log is segmented on disk: records are appended to the active segment
//! file and a new segment is rolled once it passes the size threshold. The
//! full entry list is mirrored in memory, which keeps last-entry lookup O(1)
//! and lets readers fetch by offset without touching disk.
//!
//! The WAL doubles as the publish/subscribe source for replication: every
//! append publishes the new head offset on a watch channel, and follower
//! cursors pull entries by offset. Entry payloads are `Bytes`, so readers
//! share the buffer instead of copying it per cursor.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bytes::Bytes;
use crc32fast::Hasher;
use tokio::sync::watch;

use crate::proto::{read_i64, read_slice, EntryId, LogEntry, Offset, INVALID_OFFSET};

const WAL_SEGMENT_PREFIX: &str = "wal-";
const WAL_SEGMENT_SUFFIX: &str = ".log";
const WAL_SEGMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Controls how appends are made durable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Rely on OS buffering; fastest, weakest.
    None,
    /// `sync_data` after each append.
    #[default]
    Data,
    /// `sync_all` after each append.
    All,
}

impl SyncMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Some(SyncMode::None),
            "data" => Some(SyncMode::Data),
            "all" => Some(SyncMode::All),
            _ => None,
        }
    }
}

/// Durable ordered log owned by one shard controller.
///
/// Invariant: offsets are dense from 0 and strictly increasing; epochs are
/// non-decreasing across offsets. `append` enforces both.
pub trait Wal: Send + Sync + 'static {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<()>;
    fn read(&self, offset: Offset) -> anyhow::Result<Option<LogEntry>>;
    fn last_entry(&self) -> Option<LogEntry>;
    fn head_index(&self) -> EntryId;
    /// Discard every entry past `head` and return the new head index.
    fn truncate(&self, head: EntryId) -> anyhow::Result<EntryId>;
    /// Watch the last durably appended offset (`INVALID_OFFSET` when empty).
    fn watch_head(&self) -> watch::Receiver<Offset>;
    fn close(&self) -> anyhow::Result<()>;
}

pub trait WalFactory: Send + Sync + 'static {
    fn wal(&self, shard: u64) -> anyhow::Result<Arc<dyn Wal>>;
}

/// In-memory entry mirror shared by both WAL implementations.
struct EntryLog {
    entries: Vec<LogEntry>,
    closed: bool,
}

impl EntryLog {
    fn head_index(&self) -> EntryId {
        self.entries
            .last()
            .map(LogEntry::entry_id)
            .unwrap_or_else(EntryId::invalid)
    }

    fn check_append(&self, entry: &LogEntry) -> anyhow::Result<()> {
        anyhow::ensure!(!self.closed, "wal is closed");
        let expected = self.entries.len() as Offset;
        anyhow::ensure!(
            entry.offset == expected,
            "wal append out of order: offset {} expected {expected}",
            entry.offset,
        );
        if let Some(last) = self.entries.last() {
            anyhow::ensure!(
                entry.epoch >= last.epoch,
                "wal append epoch regression: {} after {}",
                entry.epoch,
                last.epoch,
            );
        }
        Ok(())
    }

    fn truncate_entries(&mut self, head: EntryId) -> anyhow::Result<()> {
        if head.offset == INVALID_OFFSET {
            self.entries.clear();
            return Ok(());
        }
        let idx = head.offset as usize;
        anyhow::ensure!(
            idx < self.entries.len(),
            "truncate past head: offset {} len {}",
            head.offset,
            self.entries.len(),
        );
        anyhow::ensure!(
            self.entries[idx].epoch == head.epoch,
            "truncate epoch mismatch at offset {}: {} != {}",
            head.offset,
            self.entries[idx].epoch,
            head.epoch,
        );
        self.entries.truncate(idx + 1);
        Ok(())
    }
}

/// One on-disk segment file and the offset of its first record.
struct Segment {
    index: u64,
    path: PathBuf,
    first_offset: Offset,
}

struct FileWalState {
    log: EntryLog,
    segments: Vec<Segment>,
    /// Append handle on the last segment, if one is open.
    file: Option<File>,
    active_bytes: u64,
}

/// Segmented file-backed WAL.
pub struct FileWal {
    dir: PathBuf,
    sync_mode: SyncMode,
    segment_max_bytes: u64,
    state: Mutex<FileWalState>,
    head_tx: watch::Sender<Offset>,
}

impl FileWal {
    pub fn open_dir(path: impl AsRef<Path>, sync_mode: SyncMode) -> anyhow::Result<Self> {
        Self::open_dir_with(path, sync_mode, WAL_SEGMENT_MAX_BYTES)
    }

    /// `segment_max_bytes` bounds how large a segment grows before the log
    /// rolls to a new file.
    pub fn open_dir_with(
        path: impl AsRef<Path>,
        sync_mode: SyncMode,
        segment_max_bytes: u64,
    ) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create wal dir")?;

        let mut segments = load_segment_paths(&dir)?;
        let mut entries = Vec::new();
        for segment in &mut segments {
            segment.first_offset = entries.len() as Offset;
            let loaded = read_segment_entries(&segment.path)
                .with_context(|| format!("load wal segment {}", segment.path.display()))?;
            entries.extend(loaded);
        }
        for (idx, entry) in entries.iter().enumerate() {
            anyhow::ensure!(
                entry.offset == idx as Offset,
                "wal segments are not contiguous at offset {idx}"
            );
        }

        let (file, active_bytes) = match segments.last() {
            Some(segment) => {
                let file = open_segment_for_append(&segment.path)?;
                let active_bytes = file.metadata().map(|meta| meta.len()).unwrap_or(0);
                (Some(file), active_bytes)
            }
            None => (None, 0),
        };
        let head = entries
            .last()
            .map(|entry| entry.offset)
            .unwrap_or(INVALID_OFFSET);
        let (head_tx, _) = watch::channel(head);
        Ok(Self {
            dir,
            sync_mode,
            segment_max_bytes: segment_max_bytes.max(1),
            state: Mutex::new(FileWalState {
                log: EntryLog {
                    entries,
                    closed: false,
                },
                segments,
                file,
                active_bytes,
            }),
            head_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileWalState> {
        // Lock poisoning only happens after a panic in this module; treat the
        // state as still usable rather than propagating the panic.
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Open a fresh segment whose first record will be `first_offset`.
    fn roll_segment(&self, state: &mut FileWalState, first_offset: Offset) -> anyhow::Result<()> {
        let index = state
            .segments
            .last()
            .map(|segment| segment.index + 1)
            .unwrap_or(0);
        let path = self.dir.join(segment_file_name(index));
        let file = open_segment_for_append(&path)?;
        state.segments.push(Segment {
            index,
            path,
            first_offset,
        });
        state.file = Some(file);
        state.active_bytes = 0;
        Ok(())
    }
}

impl Wal for FileWal {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.log.check_append(entry)?;
        if state.file.is_none() || state.active_bytes >= self.segment_max_bytes {
            self.roll_segment(&mut state, entry.offset)?;
        }
        let payload = encode_entry(entry);
        let record_bytes = (payload.len() + 8) as u64;
        let file = state.file.as_mut().context("wal segment missing")?;
        write_record(file, &payload)?;
        file.flush()?;
        sync_file(file, self.sync_mode)?;
        state.active_bytes += record_bytes;
        state.log.entries.push(entry.clone());
        drop(state);
        self.head_tx.send_replace(entry.offset);
        Ok(())
    }

    fn read(&self, offset: Offset) -> anyhow::Result<Option<LogEntry>> {
        anyhow::ensure!(offset >= 0, "negative wal offset {offset}");
        Ok(self.lock().log.entries.get(offset as usize).cloned())
    }

    fn last_entry(&self) -> Option<LogEntry> {
        self.lock().log.entries.last().cloned()
    }

    fn head_index(&self) -> EntryId {
        self.lock().log.head_index()
    }

    fn truncate(&self, head: EntryId) -> anyhow::Result<EntryId> {
        let mut state = self.lock();
        anyhow::ensure!(!state.log.closed, "wal is closed");
        state.log.truncate_entries(head)?;
        state.file = None;

        // Delete segments that start past the new head outright.
        while let Some(segment) = state.segments.last() {
            if segment.first_offset <= head.offset {
                break;
            }
            let path = segment.path.clone();
            state.segments.pop();
            fs::remove_file(&path)
                .with_context(|| format!("remove wal segment {}", path.display()))?;
        }

        // Rewrite the boundary segment so it holds exactly the surviving
        // records, going through a temp file to never leave a torn segment.
        let boundary = state
            .segments
            .last()
            .map(|segment| (segment.path.clone(), segment.first_offset));
        if let Some((path, first_offset)) = boundary {
            let payloads: Vec<Vec<u8>> = state.log.entries[first_offset as usize..]
                .iter()
                .map(encode_entry)
                .collect();
            let tmp_path = path.with_extension("log.tmp");
            let mut out = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp_path)
                .context("open wal truncate temp")?;
            let mut written = 0u64;
            for payload in &payloads {
                written += (payload.len() + 8) as u64;
                write_record(&mut out, payload)?;
            }
            out.flush()?;
            out.sync_all()?;
            fs::rename(&tmp_path, &path).context("replace wal segment")?;
            state.file = Some(open_segment_for_append(&path)?);
            state.active_bytes = written;
        } else {
            state.active_bytes = 0;
        }

        let new_head = state.log.head_index();
        drop(state);
        self.head_tx.send_replace(new_head.offset);
        Ok(new_head)
    }

    fn watch_head(&self) -> watch::Receiver<Offset> {
        self.head_tx.subscribe()
    }

    fn close(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.log.closed {
            return Ok(());
        }
        if let Some(file) = state.file.take() {
            sync_file(&file, SyncMode::All)?;
        }
        state.log.closed = true;
        Ok(())
    }
}

/// Factory producing one file-backed WAL directory per shard.
pub struct FileWalFactory {
    base_dir: PathBuf,
    sync_mode: SyncMode,
}

impl FileWalFactory {
    pub fn new(base_dir: impl AsRef<Path>, sync_mode: SyncMode) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            sync_mode,
        }
    }
}

impl WalFactory for FileWalFactory {
    fn wal(&self, shard: u64) -> anyhow::Result<Arc<dyn Wal>> {
        let dir = self.base_dir.join(format!("shard-{shard}"));
        Ok(Arc::new(FileWal::open_dir(dir, self.sync_mode)?))
    }
}

/// In-memory WAL with the same ordering contract, for tests and tooling.
/// Close is a no-op so a controller restart against the same factory keeps
/// the log content.
pub struct MemoryWal {
    state: Mutex<EntryLog>,
    head_tx: watch::Sender<Offset>,
}

impl MemoryWal {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(INVALID_OFFSET);
        Self {
            state: Mutex::new(EntryLog {
                entries: Vec::new(),
                closed: false,
            }),
            head_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntryLog> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl Wal for MemoryWal {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.check_append(entry)?;
        state.entries.push(entry.clone());
        drop(state);
        self.head_tx.send_replace(entry.offset);
        Ok(())
    }

    fn read(&self, offset: Offset) -> anyhow::Result<Option<LogEntry>> {
        anyhow::ensure!(offset >= 0, "negative wal offset {offset}");
        Ok(self.lock().entries.get(offset as usize).cloned())
    }

    fn last_entry(&self) -> Option<LogEntry> {
        self.lock().entries.last().cloned()
    }

    fn head_index(&self) -> EntryId {
        self.lock().head_index()
    }

    fn truncate(&self, head: EntryId) -> anyhow::Result<EntryId> {
        let mut state = self.lock();
        state.truncate_entries(head)?;
        let new_head = state.head_index();
        drop(state);
        self.head_tx.send_replace(new_head.offset);
        Ok(new_head)
    }

    fn watch_head(&self) -> watch::Receiver<Offset> {
        self.head_tx.subscribe()
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Factory that hands out one shared in-memory WAL per shard.
pub struct MemoryWalFactory {
    wals: Mutex<std::collections::HashMap<u64, Arc<MemoryWal>>>,
}

impl MemoryWalFactory {
    pub fn new() -> Self {
        Self {
            wals: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryWalFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WalFactory for MemoryWalFactory {
    fn wal(&self, shard: u64) -> anyhow::Result<Arc<dyn Wal>> {
        let mut wals = self.wals.lock().unwrap_or_else(|err| err.into_inner());
        let wal = wals
            .entry(shard)
            .or_insert_with(|| Arc::new(MemoryWal::new()));
        Ok(wal.clone())
    }
}

fn segment_file_name(index: u64) -> String {
    format!("{WAL_SEGMENT_PREFIX}{index:08}{WAL_SEGMENT_SUFFIX}")
}

fn parse_segment_index(name: &str) -> Option<u64> {
    let stem = name
        .strip_prefix(WAL_SEGMENT_PREFIX)?
        .strip_suffix(WAL_SEGMENT_SUFFIX)?;
    stem.parse().ok()
}

/// Enumerate segment files in index order. `first_offset` is filled in by the
/// caller while loading.
fn load_segment_paths(dir: &Path) -> anyhow::Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for dirent in fs::read_dir(dir).context("read wal dir")? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = parse_segment_index(name) {
            segments.push(Segment {
                index,
                path: dirent.path(),
                first_offset: INVALID_OFFSET,
            });
        }
    }
    segments.sort_by_key(|segment| segment.index);
    Ok(segments)
}

fn encode_entry(entry: &LogEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 4 + entry.value.len());
    out.extend_from_slice(&entry.epoch.to_be_bytes());
    out.extend_from_slice(&entry.offset.to_be_bytes());
    out.extend_from_slice(&(entry.value.len() as u32).to_be_bytes());
    out.extend_from_slice(&entry.value);
    out
}

fn decode_entry(buf: &[u8]) -> anyhow::Result<LogEntry> {
    let mut offset = 0usize;
    let epoch = read_i64(buf, &mut offset)?;
    let entry_offset = read_i64(buf, &mut offset)?;
    let value = read_slice(buf, &mut offset)?;
    Ok(LogEntry {
        epoch,
        offset: entry_offset,
        value: Bytes::from(value),
    })
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn read_segment_entries(path: &Path) -> anyhow::Result<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "wal checksum mismatch");
        entries.push(decode_entry(&payload)?);
    }
    Ok(entries)
}

fn open_segment_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn sync_file(file: &File, mode: SyncMode) -> std::io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data(),
        SyncMode::All => file.sync_all(),
    }
}
