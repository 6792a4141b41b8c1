//! Append-only log of series creations and removals
//!
//! Every record is framed as:
//! - 4 bytes: frame length (excluding this field)
//! - 1 byte: record type
//! - 8 bytes: series ID
//! - 4 bytes: payload length
//! - N bytes: payload (bincode-encoded labels for `Create`)
//! - 4 bytes: CRC32 of everything after the length field

use super::SyncPolicy;
use crate::fsutil;
use crate::{Labels, QuiverError, Result, SeriesId};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

pub const SERIES_LOG_FILE: &str = "series.log";

/// Frame bytes after the length field, excluding the payload
const FRAME_OVERHEAD: usize = 1 + 8 + 4 + 4;

/// Largest encoded label set accepted in a record
pub const MAX_LABELS_BYTES: usize = 64 * 1024;

/// Frames longer than this cannot have been written by [`SeriesRecord::encode`]
const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_LABELS_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Create = 1,
    Tombstone = 2,
    NextId = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = QuiverError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Create),
            2 => Ok(RecordType::Tombstone),
            3 => Ok(RecordType::NextId),
            _ => Err(QuiverError::IndexCorruption(format!(
                "invalid series log record type: {}",
                value
            ))),
        }
    }
}

/// A single series log record
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesRecord {
    /// Series created with the given labels
    Create { id: SeriesId, labels: Labels },
    /// Series removed by a retention sweep
    Tombstone { id: SeriesId },
    /// Lower bound for the next allocated ID, written when the log is compacted
    NextId { id: SeriesId },
}

enum Frame {
    Complete(SeriesRecord, usize),
    Incomplete,
}

impl SeriesRecord {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        buf.put_u32_le(0);

        let (kind, id, payload) = match self {
            SeriesRecord::Create { id, labels } => {
                (RecordType::Create, *id, bincode::serialize(labels)?)
            }
            SeriesRecord::Tombstone { id } => (RecordType::Tombstone, *id, Vec::new()),
            SeriesRecord::NextId { id } => (RecordType::NextId, *id, Vec::new()),
        };
        if payload.len() > MAX_LABELS_BYTES {
            buf.truncate(start);
            return Err(QuiverError::InvalidSample(format!(
                "label set of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_LABELS_BYTES
            )));
        }
        buf.put_u8(kind as u8);
        buf.put_u64_le(id);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf[start + 4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - start - 4) as u32;
        buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<Frame> {
        if data.len() < 4 {
            return Ok(Frame::Incomplete);
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_LEN).contains(&len) {
            return Err(QuiverError::IndexCorruption(format!(
                "series log frame length {} out of bounds",
                len
            )));
        }
        if data.len() < 4 + len {
            return Ok(Frame::Incomplete);
        }

        let frame = &data[4..4 + len];
        let (body, mut crc) = frame.split_at(len - 4);
        let expected = crc.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(QuiverError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let kind = RecordType::try_from(cursor.get_u8())?;
        let id = cursor.get_u64_le();
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != payload_len {
            return Err(QuiverError::IndexCorruption(format!(
                "series log payload length {} does not match frame",
                payload_len
            )));
        }

        let record = match kind {
            RecordType::Create => SeriesRecord::Create {
                id,
                labels: bincode::deserialize(cursor)
                    .map_err(|e| QuiverError::IndexCorruption(e.to_string()))?,
            },
            RecordType::Tombstone => SeriesRecord::Tombstone { id },
            RecordType::NextId => SeriesRecord::NextId { id },
        };
        Ok(Frame::Complete(record, 4 + len))
    }
}

/// State recovered from the log on open
#[derive(Debug, Default)]
pub struct Replay {
    /// Live series, ordered by ID
    pub series: Vec<(SeriesId, Labels)>,
    /// Next ID to allocate
    pub next_id: SeriesId,
    /// Tombstone records encountered
    pub tombstones: usize,
}

/// Durable series log
pub struct SeriesLog {
    path: PathBuf,
    sync_policy: SyncPolicy,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: BufWriter<File>,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl SeriesLog {
    /// Open the log in `dir`, replaying existing records
    ///
    /// A torn final frame is dropped. A checksum failure with more data after
    /// it means the log itself is damaged, and the index refuses to open.
    pub fn open(dir: &Path, sync_policy: SyncPolicy) -> Result<(Self, Replay)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SERIES_LOG_FILE);

        let (replay, rewrite) = if path.exists() {
            Self::replay(&path)?
        } else {
            (Replay { next_id: 1, ..Default::default() }, false)
        };

        if rewrite || replay.tombstones > replay.series.len() {
            Self::rewrite(&path, &replay)?;
            info!(
                "Compacted series log: {} live series, {} tombstones dropped",
                replay.series.len(),
                replay.tombstones
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let log = Self {
            path,
            sync_policy,
            inner: Mutex::new(LogInner {
                file: BufWriter::new(file),
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
        };
        Ok((log, replay))
    }

    /// Read all records; the flag is set when a torn tail must be cut off
    fn replay(path: &Path) -> Result<(Replay, bool)> {
        let data = fs::read(path)?;
        let mut live: HashMap<SeriesId, Labels> = HashMap::new();
        let mut next_id: SeriesId = 1;
        let mut tombstones = 0;
        let mut offset = 0;
        let mut torn = false;

        while offset < data.len() {
            match SeriesRecord::decode(&data[offset..]) {
                Ok(Frame::Complete(record, read)) => {
                    match record {
                        SeriesRecord::Create { id, labels } => {
                            next_id = next_id.max(id + 1);
                            live.insert(id, labels);
                        }
                        SeriesRecord::Tombstone { id } => {
                            live.remove(&id);
                            tombstones += 1;
                        }
                        SeriesRecord::NextId { id } => next_id = next_id.max(id),
                    }
                    offset += read;
                }
                Ok(Frame::Incomplete) => {
                    Self::ensure_tail(&data, offset)?;
                    warn!(
                        "Torn series log record at offset {} in {:?}, truncating",
                        offset, path
                    );
                    torn = true;
                    break;
                }
                Err(QuiverError::ChecksumMismatch { expected, actual }) => {
                    let frame_end = offset + 4 + (&data[offset..offset + 4]).get_u32_le() as usize;
                    if frame_end != data.len() {
                        return Err(QuiverError::IndexCorruption(format!(
                            "series log checksum mismatch at offset {} (expected {:#010x}, got {:#010x})",
                            offset, expected, actual
                        )));
                    }
                    Self::ensure_tail(&data, offset)?;
                    warn!(
                        "Checksum mismatch in last series log record at offset {}, truncating",
                        offset
                    );
                    torn = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let mut series: Vec<(SeriesId, Labels)> = live.into_iter().collect();
        series.sort_unstable_by_key(|(id, _)| *id);
        info!(
            "Replayed series log {:?}: {} series, next id {}",
            path,
            series.len(),
            next_id
        );

        Ok((
            Replay {
                series,
                next_id,
                tombstones,
            },
            torn,
        ))
    }

    /// Fail unless the bad frame at `offset` is the last thing in the log
    ///
    /// A torn write only ever damages the final frame, so any intact frame
    /// found past `offset` means the damage is in the middle of the log.
    fn ensure_tail(data: &[u8], offset: usize) -> Result<()> {
        for start in offset + 1..data.len() {
            if let Ok(Frame::Complete(..)) = SeriesRecord::decode(&data[start..]) {
                return Err(QuiverError::IndexCorruption(format!(
                    "series log damaged at offset {} with intact records after it at offset {}",
                    offset, start
                )));
            }
        }
        Ok(())
    }

    /// Atomically replace the log with only the live records
    fn rewrite(path: &Path, replay: &Replay) -> Result<()> {
        let mut buf = BytesMut::new();
        SeriesRecord::NextId { id: replay.next_id }.encode(&mut buf)?;
        for (id, labels) in &replay.series {
            SeriesRecord::Create {
                id: *id,
                labels: labels.clone(),
            }
            .encode(&mut buf)?;
        }
        fsutil::write_atomic(path, &buf)
    }

    /// Append a batch of records, syncing according to policy
    pub fn append(&self, records: &[SeriesRecord]) -> Result<()> {
        let mut buf = BytesMut::new();
        for record in records {
            record.encode(&mut buf)?;
        }

        let mut inner = self.inner.lock();
        inner.file.write_all(&buf)?;
        inner.writes_since_sync += records.len();

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Copy a consistent image of the log to `dst`
    pub fn copy_to(&self, dst: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)?;
        fs::copy(&self.path, dst)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sync_inner(inner: &mut LogInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_data()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn should_sync(&self, inner: &LogInner) -> bool {
        match self.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }
}

impl Drop for SeriesLog {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Err(e) = Self::sync_inner(&mut inner) {
            warn!("Failed to sync series log {:?} on close: {}", self.path, e);
        }
    }
}
