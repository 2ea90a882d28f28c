//! # Change-Log Write-Ahead Log
//!
//! **Crash recovery for the world store**
//!
//! Every committed transaction is appended here before the in-memory table
//! is touched. On restart the log is replayed in tick order and rebuilds the
//! exact table and clock the process had before it died.
//!
//! ## Guarantees
//!
//! 1. **Durability**: once `append_commit()` returns, the record is on disk
//! 2. **Determinism**: replaying the same records yields the same table
//! 3. **Torn tails**: a record with a bad length or CRC ends recovery and is
//!    cut off, so later appends are never hidden behind garbage
//! 4. **Failed appends**: a record that fails to write or sync is cut back
//!    off the file before `append_commit()` returns the error
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "MWAL"]
//! [4 bytes: version]
//! [8 bytes: tick at last checkpoint]
//!
//! Entry format:
//! [8 bytes: tick]
//! [1 byte: record kind (COMMIT/SNAPSHOT)]
//! [4 bytes: payload length]
//! [N bytes: payload (bincode)]
//! [4 bytes: CRC32 of above]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use meridian_core::{EntityId, ProposedChange, TableRecord, Tick, VersionedTable};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{WorldError, WorldResult};

/// Magic bytes identifying a WAL file.
const WAL_MAGIC: &[u8; 4] = b"MWAL";

/// Current WAL format version.
const WAL_VERSION: u32 = 1;

/// Header size in bytes.
const HEADER_LEN: u64 = 16;

/// Fixed bytes around each payload: tick, kind, length, CRC.
const FRAME_OVERHEAD: u64 = 8 + 1 + 4 + 4;

/// Largest accepted payload. Anything bigger is treated as a torn record.
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// WAL record kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    /// One committed transaction's proposed changes.
    Commit = 1,
    /// One table record written by a checkpoint.
    Snapshot = 2,
}

impl RecordKind {
    /// Converts from u8.
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Commit),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// Byte sink under the WAL's append handle.
pub(crate) trait WalSink: Write + Send {
    /// Makes everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Cuts the sink back to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl WalSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append handle plus the length of its durable prefix.
struct Appender {
    sink: Box<dyn WalSink>,
    len: u64,
    /// Set when a failed record could not be cut off; no further appends.
    broken: bool,
}

impl Appender {
    fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        self.sink.write_all(frame)?;
        self.sink.flush()?;
        self.sink.sync()
    }
}

/// State rebuilt from disk.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Rebuilt table.
    pub table: VersionedTable,
    /// Highest tick found.
    pub tick: Tick,
    /// Records replayed.
    pub records: usize,
    /// Whether a damaged tail was discarded.
    pub truncated: bool,
}

/// Append-only log of committed transactions.
pub struct ChangeLogWal {
    /// Path to the WAL file.
    path: PathBuf,
    /// Append handle.
    appender: Mutex<Appender>,
}

impl std::fmt::Debug for ChangeLogWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLogWal").field("path", &self.path).finish()
    }
}

impl ChangeLogWal {
    /// Opens or creates a WAL file and replays it.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a foreign file, or an unsupported version.
    pub fn open(path: impl AsRef<Path>) -> WorldResult<(Self, Recovery)> {
        Self::open_with(path, |file| Box::new(file))
    }

    /// [`ChangeLogWal::open`] with the append handle wrapped by `sink`.
    pub(crate) fn open_with(
        path: impl AsRef<Path>,
        sink: impl FnOnce(File) -> Box<dyn WalSink>,
    ) -> WorldResult<(Self, Recovery)> {
        let path = path.as_ref().to_path_buf();

        if fs::metadata(&path).map_or(true, |meta| meta.len() == 0) {
            Self::write_header(&path, 0)?;
        }

        let (recovery, valid_len) = Self::recover(&path)?;
        if recovery.truncated {
            warn!(path = %path.display(), valid_len, "discarding damaged WAL tail");
            OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
        }
        info!(
            path = %path.display(),
            tick = recovery.tick,
            records = recovery.records,
            live = recovery.table.live_count(),
            "WAL recovered"
        );

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok((
            Self {
                path,
                appender: Mutex::new(Appender {
                    sink: sink(file),
                    len: valid_len,
                    broken: false,
                }),
            },
            recovery,
        ))
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably appends one committed transaction.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Wal`] if the record could not be written and
    /// synced. The file is cut back to its previous length first; if that
    /// fails too, every later append is refused.
    pub fn append_commit(&self, tick: Tick, changes: &[ProposedChange]) -> WorldResult<()> {
        let payload = bincode::serialize(changes).map_err(|e| WorldError::Wal(e.to_string()))?;
        let frame = encode_record(tick, RecordKind::Commit, &payload)?;

        let mut appender = self.appender.lock();
        if appender.broken {
            return Err(WorldError::Wal("log unusable after a failed rollback".to_string()));
        }
        match appender.append(&frame) {
            Ok(()) => {
                appender.len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                let len = appender.len;
                if let Err(cut) = appender.sink.truncate(len) {
                    error!(path = %self.path.display(), error = %cut, "WAL rollback failed");
                    appender.broken = true;
                } else {
                    warn!(path = %self.path.display(), tick, error = %e, "WAL append rolled back");
                }
                Err(e.into())
            }
        }
    }

    /// Rewrites the log as one snapshot record per table record.
    ///
    /// The new file is built next to the old one and renamed over it, so a
    /// crash mid-checkpoint leaves the previous log intact.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Wal`] on any I/O failure.
    pub fn checkpoint(&self, tick: Tick, table: &VersionedTable) -> WorldResult<()> {
        let mut appender = self.appender.lock();

        let staging = self.path.with_extension("wal.tmp");
        Self::write_header(&staging, tick)?;
        {
            let mut out = BufWriter::new(OpenOptions::new().append(true).open(&staging)?);
            for (id, record) in table.records() {
                let payload = bincode::serialize(&(id, record))
                    .map_err(|e| WorldError::Wal(e.to_string()))?;
                out.write_all(&encode_record(tick, RecordKind::Snapshot, &payload)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;

        *appender = Appender {
            sink: Box::new(OpenOptions::new().append(true).open(&self.path)?),
            len: fs::metadata(&self.path)?.len(),
            broken: false,
        };
        info!(path = %self.path.display(), tick, "WAL checkpointed");
        Ok(())
    }

    fn write_header(path: &Path, tick: Tick) -> WorldResult<()> {
        let mut file = File::create(path)?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&WAL_VERSION.to_le_bytes())?;
        file.write_all(&tick.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Replays the file. Returns the recovered state and the length of the
    /// valid prefix.
    fn recover(path: &Path) -> WorldResult<(Recovery, u64)> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(WorldError::CorruptWal("invalid WAL magic".to_string()));
        }

        let mut version_bytes = [0u8; 4];
        reader.read_exact(&mut version_bytes)?;
        let version = u32::from_le_bytes(version_bytes);
        if version != WAL_VERSION {
            return Err(WorldError::CorruptWal(format!("unsupported WAL version: {version}")));
        }

        let mut tick_bytes = [0u8; 8];
        reader.read_exact(&mut tick_bytes)?;

        let mut recovery = Recovery {
            tick: u64::from_le_bytes(tick_bytes),
            ..Recovery::default()
        };
        let mut valid_len = HEADER_LEN;

        loop {
            let (tick, kind, payload) = match read_record(&mut reader) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "WAL record unreadable");
                    recovery.truncated = true;
                    break;
                }
            };

            match kind {
                RecordKind::Commit => {
                    let changes: Vec<ProposedChange> = bincode::deserialize(&payload)
                        .map_err(|e| WorldError::CorruptWal(e.to_string()))?;
                    recovery.table.apply(tick, &changes);
                }
                RecordKind::Snapshot => {
                    let (id, record): (EntityId, TableRecord) = bincode::deserialize(&payload)
                        .map_err(|e| WorldError::CorruptWal(e.to_string()))?;
                    recovery.table.restore(id, record);
                }
            }

            recovery.tick = recovery.tick.max(tick);
            recovery.records += 1;
            valid_len += FRAME_OVERHEAD + payload.len() as u64;
        }

        Ok((recovery, valid_len))
    }
}

fn encode_record(tick: Tick, kind: RecordKind, payload: &[u8]) -> WorldResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD)
        .ok_or_else(|| WorldError::Wal(format!("record too large: {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(8 + 1 + 4 + payload.len() + 4);
    frame.extend_from_slice(&tick.to_le_bytes());
    frame.push(kind as u8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Reads one record. `Ok(None)` at a clean end of file.
fn read_record(reader: &mut impl BufRead) -> WorldResult<Option<(Tick, RecordKind, Vec<u8>)>> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }

    let mut tick_bytes = [0u8; 8];
    reader.read_exact(&mut tick_bytes)?;

    let mut kind_byte = [0u8; 1];
    reader.read_exact(&mut kind_byte)?;
    let kind = RecordKind::from_u8(kind_byte[0])
        .ok_or_else(|| WorldError::CorruptWal("invalid record kind".to_string()))?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_PAYLOAD {
        return Err(WorldError::CorruptWal(format!("implausible record length {len}")));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tick_bytes);
    hasher.update(&kind_byte);
    hasher.update(&len_bytes);
    hasher.update(&payload);
    if hasher.finalize() != stored_crc {
        return Err(WorldError::CorruptWal("CRC mismatch".to_string()));
    }

    Ok(Some((u64::from_le_bytes(tick_bytes), kind, payload)))
}

/// File sink that fails once its budget of good appends is spent, leaving
/// half of the failing write on disk.
#[cfg(test)]
pub(crate) struct FlakySink {
    file: File,
    budget: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl FlakySink {
    pub(crate) fn new(file: File, budget: std::sync::Arc<std::sync::atomic::AtomicUsize>) -> Self {
        Self { file, budget }
    }

    fn spent(&self) -> bool {
        self.budget.load(std::sync::atomic::Ordering::SeqCst) == 0
    }
}

#[cfg(test)]
impl Write for FlakySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.spent() {
            self.file.write_all(&buf[..buf.len() / 2])?;
            return Err(io::Error::other("disk full"));
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
impl WalSink for FlakySink {
    fn sync(&mut self) -> io::Result<()> {
        if self.spent() {
            return Err(io::Error::other("disk full"));
        }
        self.budget.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        self.file.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}
