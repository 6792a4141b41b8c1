//! Part writer

use super::block::{Block, BlockRef};
use super::{part_path, PartConfig, PartMeta, FORMAT_VERSION, MAGIC};
use crate::fsutil;
use crate::{QuiverError, Result, SeriesId, Timestamp};
use bytes::{BufMut, BytesMut};
use roaring::RoaringTreemap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub(crate) const HEADER_SIZE: usize = 16;
pub(crate) const FOOTER_SIZE: usize = 8 * 8 + 4 + 4 + 4;

/// Streams sorted series into a new part file
///
/// Series must be added in ascending ID order, each with strictly
/// ascending timestamps. The file is written under a temporary directory
/// and only moved into place by [`PartWriter::finish`]; dropping an
/// unfinished writer removes the temporary file.
pub struct PartWriter {
    config: PartConfig,
    id: u64,
    level: u32,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    offset: u64,
    index: Vec<BlockRef>,
    series: RoaringTreemap,
    last_series: Option<SeriesId>,
    rows: u64,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

impl PartWriter {
    /// Start a new part in `tmp_dir`
    pub fn create(tmp_dir: &Path, id: u64, level: u32, config: PartConfig) -> Result<Self> {
        fs::create_dir_all(tmp_dir)?;
        let tmp_path = part_path(tmp_dir, id);
        let mut file = BufWriter::new(File::create(&tmp_path)?);

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_slice(MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        header.put_u64_le(id);
        file.write_all(&header)?;

        Ok(Self {
            config,
            id,
            level,
            tmp_path,
            file: Some(file),
            offset: HEADER_SIZE as u64,
            index: Vec::new(),
            series: RoaringTreemap::new(),
            last_series: None,
            rows: 0,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append all samples of one series, split into blocks
    pub fn add_series(
        &mut self,
        series_id: SeriesId,
        timestamps: &[Timestamp],
        values: &[f64],
    ) -> Result<()> {
        if timestamps.is_empty() {
            return Ok(());
        }
        if self.last_series.map_or(false, |last| series_id <= last) {
            return Err(QuiverError::Internal(format!(
                "series {} added after series {:?}",
                series_id, self.last_series
            )));
        }
        if !timestamps.windows(2).all(|w| w[0] < w[1]) {
            return Err(QuiverError::Internal(format!(
                "series {} timestamps are not strictly ascending",
                series_id
            )));
        }

        let chunk = self.config.max_rows_per_block.max(1);
        for (ts, vals) in timestamps.chunks(chunk).zip(values.chunks(chunk)) {
            self.write_block(series_id, ts, vals)?;
        }

        self.series.insert(series_id);
        self.last_series = Some(series_id);
        self.min_timestamp = self.min_timestamp.min(timestamps[0]);
        self.max_timestamp = self.max_timestamp.max(timestamps[timestamps.len() - 1]);
        Ok(())
    }

    fn write_block(&mut self, series_id: SeriesId, timestamps: &[Timestamp], values: &[f64]) -> Result<()> {
        let bytes = Block::encode(series_id, timestamps, values, self.config.compression)?;
        let file = self.file_mut()?;
        file.write_all(&bytes)?;

        self.index.push(BlockRef {
            series_id,
            first_timestamp: timestamps[0],
            last_timestamp: timestamps[timestamps.len() - 1],
            offset: self.offset,
            size: bytes.len() as u32,
            count: timestamps.len() as u32,
        });
        self.offset += bytes.len() as u64;
        self.rows += timestamps.len() as u64;
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| QuiverError::Internal("part writer already finished".into()))
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Write index, bitmap and footer, fsync, and move the file into `parts_dir`
    pub fn finish(mut self, parts_dir: &Path) -> Result<PartMeta> {
        let mut tail = BytesMut::new();

        let index_offset = self.offset;
        tail.put_u32_le(self.index.len() as u32);
        for entry in &self.index {
            entry.encode(&mut tail);
        }
        let checksum = crc32fast::hash(&tail);
        tail.put_u32_le(checksum);
        let index_len = tail.len() as u64;

        let bitmap_offset = index_offset + index_len;
        let mut bitmap = Vec::with_capacity(self.series.serialized_size());
        self.series.serialize_into(&mut bitmap)?;
        let bitmap_crc = crc32fast::hash(&bitmap);
        tail.put_slice(&bitmap);
        tail.put_u32_le(bitmap_crc);
        let bitmap_len = bitmap.len() as u64 + 4;

        let (min_timestamp, max_timestamp) = if self.rows == 0 {
            (0, 0)
        } else {
            (self.min_timestamp, self.max_timestamp)
        };

        let footer_start = tail.len();
        tail.put_u64_le(index_offset);
        tail.put_u64_le(index_len);
        tail.put_u64_le(bitmap_offset);
        tail.put_u64_le(bitmap_len);
        tail.put_u64_le(self.rows);
        tail.put_u64_le(self.series.len());
        tail.put_i64_le(min_timestamp);
        tail.put_i64_le(max_timestamp);
        tail.put_u32_le(self.level);
        let footer_crc = crc32fast::hash(&tail[footer_start..]);
        tail.put_u32_le(footer_crc);
        tail.put_slice(MAGIC);

        let mut file = self
            .file
            .take()
            .ok_or_else(|| QuiverError::Internal("part writer already finished".into()))?;
        file.write_all(&tail)?;
        file.flush()?;
        file.get_ref().sync_all()?;
        drop(file);

        let size_bytes = self.offset + tail.len() as u64;
        fs::create_dir_all(parts_dir)?;
        let final_path = part_path(parts_dir, self.id);
        fs::rename(&self.tmp_path, &final_path)?;
        fsutil::sync_parent(&final_path)?;

        debug!(
            "Wrote part {} ({} rows, {} series, {} bytes)",
            self.id,
            self.rows,
            self.series.len(),
            size_bytes
        );

        Ok(PartMeta {
            id: self.id,
            level: self.level,
            rows: self.rows,
            series: self.series.len(),
            min_timestamp,
            max_timestamp,
            size_bytes,
        })
    }
}

impl Drop for PartWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!("Failed to remove unfinished part {:?}: {}", self.tmp_path, e);
            }
        }
    }
}
