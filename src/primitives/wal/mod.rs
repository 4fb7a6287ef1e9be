#![forbid(unsafe_code)]
//! Write-ahead log store.
//!
//! Records are opaque payloads addressed by LSN (`index + 1`). Appends land in
//! memory; [`Wal::flush`] advances the durable watermark and, when a file sink
//! is attached, writes the pending frames and syncs the file. A simulated crash
//! keeps exactly the flushed prefix.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{frame_crc32, BlinkError, Checksum, Crc32Fast, Lsn, Result};

const WAL_MAGIC: [u8; 4] = *b"SBLW";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 24;
const FRAME_HEADER_LEN: usize = 16;
const MAX_FRAME_LEN: usize = 64 << 20;

/// Statistics tracking WAL operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct WalStats {
    /// Number of records appended to the log
    pub records_appended: u64,
    /// Total payload bytes appended
    pub bytes_appended: u64,
    /// Number of flushes that advanced the durable watermark
    pub flushes: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        let crc = header_crc(&buf);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(BlinkError::Corruption("wal header truncated"));
        }
        let mut header = [0u8; FILE_HEADER_LEN];
        header.copy_from_slice(&src[..FILE_HEADER_LEN]);
        if header[0..4] != WAL_MAGIC {
            return Err(BlinkError::Corruption("wal magic mismatch"));
        }
        if u16::from_be_bytes([header[4], header[5]]) != WAL_FORMAT_VERSION {
            return Err(BlinkError::Corruption("wal format version mismatch"));
        }
        if header[6..8] != [0, 0] || header[16..20] != [0, 0, 0, 0] {
            return Err(BlinkError::Corruption("wal reserved header bytes non-zero"));
        }
        let stored_crc = u32::from_be_bytes([header[20], header[21], header[22], header[23]]);
        if header_crc(&header) != stored_crc {
            return Err(BlinkError::Corruption("wal header crc mismatch"));
        }
        let mut salt = [0u8; 8];
        salt.copy_from_slice(&header[8..16]);
        Ok(Self {
            salt: u64::from_be_bytes(salt),
        })
    }
}

fn header_crc(header: &[u8; FILE_HEADER_LEN]) -> u32 {
    Crc32Fast::default().digest(&[&header[..20]])
}

fn encode_frame(lsn: Lsn, payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&lsn.0.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame_crc32(lsn.0, payload).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Decodes frames until the first torn or foreign one; returns the payloads and
/// the byte length of the valid prefix (header included).
fn decode_frames(src: &[u8]) -> (Vec<Arc<[u8]>>, usize) {
    let mut frames: Vec<Arc<[u8]>> = Vec::new();
    let mut pos = FILE_HEADER_LEN;
    while src.len() - pos >= FRAME_HEADER_LEN {
        let head = &src[pos..pos + FRAME_HEADER_LEN];
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&head[0..8]);
        let lsn = u64::from_be_bytes(lsn);
        let len = u32::from_be_bytes([head[8], head[9], head[10], head[11]]) as usize;
        let crc = u32::from_be_bytes([head[12], head[13], head[14], head[15]]);
        let start = pos + FRAME_HEADER_LEN;
        if lsn != frames.len() as u64 + 1 || len > MAX_FRAME_LEN || src.len() - start < len {
            break;
        }
        let payload = &src[start..start + len];
        if frame_crc32(lsn, payload) != crc {
            break;
        }
        frames.push(Arc::from(payload));
        pos = start + len;
    }
    (frames, pos)
}

struct FileSink {
    path: PathBuf,
    file: File,
}

struct WalState {
    frames: Vec<Arc<[u8]>>,
    flushed: usize,
    sink: Option<FileSink>,
    stats: WalStats,
}

/// The log store: `append -> LSN`, random read by LSN, flush watermark.
pub struct Wal {
    state: Mutex<WalState>,
}

impl Wal {
    /// Creates a log that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_frames(Vec::new(), None)
    }

    fn with_frames(frames: Vec<Arc<[u8]>>, sink: Option<FileSink>) -> Self {
        let flushed = frames.len();
        Self {
            state: Mutex::new(WalState {
                frames,
                flushed,
                sink,
                stats: WalStats::default(),
            }),
        }
    }

    /// Opens (or creates) a file-backed log. A torn tail left by a crash during
    /// flush is truncated away.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            let header = FileHeader {
                salt: rand::random(),
            };
            file.write_all(&header.encode())?;
            file.sync_data()?;
            debug!(path = %path.display(), salt = header.salt, "wal.create");
            return Ok(Self::with_frames(Vec::new(), Some(FileSink { path, file })));
        }
        FileHeader::decode(&bytes)?;
        let (frames, valid_len) = decode_frames(&bytes);
        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - valid_len,
                "wal.torn_tail_truncated"
            );
            file.set_len(valid_len as u64)?;
            file.sync_data()?;
        }
        debug!(path = %path.display(), records = frames.len(), "wal.open");
        Ok(Self::with_frames(frames, Some(FileSink { path, file })))
    }

    /// Appends a record and returns its LSN.
    pub fn append(&self, payload: &[u8]) -> Result<Lsn> {
        let mut state = self.state.lock();
        state.frames.push(Arc::from(payload));
        state.stats.records_appended += 1;
        state.stats.bytes_appended += payload.len() as u64;
        Ok(Lsn(state.frames.len() as u64))
    }

    /// Reads the record stored at `lsn`.
    pub fn read(&self, lsn: Lsn) -> Result<Arc<[u8]>> {
        let state = self.state.lock();
        lsn.0
            .checked_sub(1)
            .and_then(|idx| state.frames.get(idx as usize))
            .cloned()
            .ok_or(BlinkError::Invalid("lsn out of range"))
    }

    /// Makes every appended record durable and returns the durable LSN.
    pub fn flush(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        let target = state.frames.len();
        Self::flush_locked(&mut state, target)?;
        Ok(Lsn(state.flushed as u64))
    }

    /// Makes records up to and including `lsn` durable.
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        let target = (lsn.0 as usize).min(state.frames.len());
        Self::flush_locked(&mut state, target)
    }

    fn flush_locked(state: &mut WalState, target: usize) -> Result<()> {
        if target <= state.flushed {
            return Ok(());
        }
        if let Some(sink) = state.sink.as_mut() {
            let mut buf = Vec::new();
            for (idx, payload) in state.frames[state.flushed..target].iter().enumerate() {
                let lsn = Lsn((state.flushed + idx + 1) as u64);
                encode_frame(lsn, payload, &mut buf);
            }
            sink.file.seek(SeekFrom::End(0))?;
            sink.file.write_all(&buf)?;
            sink.file.sync_data()?;
        }
        state.flushed = target;
        state.stats.flushes += 1;
        Ok(())
    }

    /// Highest LSN known durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.state.lock().flushed as u64)
    }

    /// Highest LSN appended so far.
    pub fn last_lsn(&self) -> Lsn {
        Lsn(self.state.lock().frames.len() as u64)
    }

    /// Snapshot of every record in LSN order.
    pub fn records(&self) -> Vec<(Lsn, Arc<[u8]>)> {
        let state = self.state.lock();
        state
            .frames
            .iter()
            .enumerate()
            .map(|(idx, payload)| (Lsn(idx as u64 + 1), payload.clone()))
            .collect()
    }

    /// Returns the log a restarted process would see: the flushed prefix only.
    pub fn crash(&self) -> Result<Wal> {
        let state = self.state.lock();
        match state.sink.as_ref() {
            Some(sink) => Wal::open(&sink.path),
            None => Ok(Wal::with_frames(
                state.frames[..state.flushed].to_vec(),
                None,
            )),
        }
    }

    /// Snapshot of the WAL counters.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats
    }
}
