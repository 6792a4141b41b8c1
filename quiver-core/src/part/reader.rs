//! Part reader

use super::block::{Block, BlockRef};
use super::writer::{FOOTER_SIZE, HEADER_SIZE};
use super::{PartMeta, FORMAT_VERSION, MAGIC};
use crate::mempart::SeriesColumns;
use crate::{QuiverError, Result, SeriesId, TimeRange};
use bytes::Buf;
use parking_lot::Mutex;
use roaring::RoaringTreemap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Read access to one immutable part file
///
/// The block index and series bitmap are loaded and verified on open;
/// block data is read on demand.
#[derive(Debug)]
pub struct PartReader {
    path: PathBuf,
    meta: PartMeta,
    index: Vec<BlockRef>,
    series: RoaringTreemap,
    file: Mutex<File>,
}

struct Footer {
    index_offset: u64,
    index_len: u64,
    bitmap_offset: u64,
    bitmap_len: u64,
    rows: u64,
    series: u64,
    min_timestamp: i64,
    max_timestamp: i64,
    level: u32,
}

impl Footer {
    fn decode(data: &[u8]) -> Result<Self> {
        let (body, mut trailer) = data.split_at(FOOTER_SIZE - 8);
        let expected = trailer.get_u32_le();
        if trailer != &MAGIC[..] {
            return Err(QuiverError::InvalidFormat("Invalid part magic".into()));
        }
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(QuiverError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        Ok(Self {
            index_offset: cursor.get_u64_le(),
            index_len: cursor.get_u64_le(),
            bitmap_offset: cursor.get_u64_le(),
            bitmap_len: cursor.get_u64_le(),
            rows: cursor.get_u64_le(),
            series: cursor.get_u64_le(),
            min_timestamp: cursor.get_i64_le(),
            max_timestamp: cursor.get_i64_le(),
            level: cursor.get_u32_le(),
        })
    }
}

impl PartReader {
    /// Open a part file and verify its header, footer, index and bitmap
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(QuiverError::InvalidFormat(format!(
                "Part {:?} too short: {} bytes",
                path, file_size
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        let mut cursor = &header[..];
        if &cursor[..4] != &MAGIC[..] {
            return Err(QuiverError::InvalidFormat("Invalid part header".into()));
        }
        cursor.advance(4);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(QuiverError::InvalidFormat(format!(
                "Unsupported part version: {}",
                version
            )));
        }
        let id = cursor.get_u64_le();

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;
        let footer = Footer::decode(&footer)?;

        let data_end = file_size - FOOTER_SIZE as u64;
        if footer.index_offset < HEADER_SIZE as u64
            || footer.index_offset.checked_add(footer.index_len) != Some(footer.bitmap_offset)
            || footer.bitmap_offset.checked_add(footer.bitmap_len) != Some(data_end)
        {
            return Err(QuiverError::Corruption(format!(
                "Part {:?} section offsets are inconsistent",
                path
            )));
        }

        let index = Self::read_index(&mut file, &footer)?;
        let series = Self::read_bitmap(&mut file, &footer)?;

        if series.len() != footer.series {
            return Err(QuiverError::Corruption(format!(
                "Part {:?} lists {} series but bitmap holds {}",
                path,
                footer.series,
                series.len()
            )));
        }
        let indexed_rows: u64 = index.iter().map(|b| b.count as u64).sum();
        if indexed_rows != footer.rows {
            return Err(QuiverError::Corruption(format!(
                "Part {:?} lists {} rows but blocks hold {}",
                path, footer.rows, indexed_rows
            )));
        }
        for entry in &index {
            let end = entry.offset + entry.size as u64;
            if entry.offset < HEADER_SIZE as u64 || end > footer.index_offset {
                return Err(QuiverError::Corruption(format!(
                    "Block of series {} at {} lies outside the data section",
                    entry.series_id, entry.offset
                )));
            }
        }

        let meta = PartMeta {
            id,
            level: footer.level,
            rows: footer.rows,
            series: footer.series,
            min_timestamp: footer.min_timestamp,
            max_timestamp: footer.max_timestamp,
            size_bytes: file_size,
        };

        Ok(Self {
            path: path.to_path_buf(),
            meta,
            index,
            series,
            file: Mutex::new(file),
        })
    }

    fn read_index(file: &mut File, footer: &Footer) -> Result<Vec<BlockRef>> {
        if footer.index_len < 8 {
            return Err(QuiverError::Corruption("Part block index truncated".into()));
        }
        file.seek(SeekFrom::Start(footer.index_offset))?;
        let mut data = vec![0u8; footer.index_len as usize];
        file.read_exact(&mut data)?;

        let (body, mut crc) = data.split_at(data.len() - 4);
        let expected = crc.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(QuiverError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let count = cursor.get_u32_le() as usize;
        if cursor.remaining() != count * BlockRef::SIZE {
            return Err(QuiverError::Corruption(format!(
                "Part block index holds {} bytes for {} entries",
                cursor.remaining(),
                count
            )));
        }

        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            index.push(BlockRef::decode(&mut cursor)?);
        }
        let ordered = index.windows(2).all(|w| {
            (w[0].series_id, w[0].last_timestamp) < (w[1].series_id, w[1].first_timestamp)
        });
        if !ordered {
            return Err(QuiverError::Corruption("Part block index is not sorted".into()));
        }
        Ok(index)
    }

    fn read_bitmap(file: &mut File, footer: &Footer) -> Result<RoaringTreemap> {
        if footer.bitmap_len < 4 {
            return Err(QuiverError::Corruption("Part series bitmap truncated".into()));
        }
        file.seek(SeekFrom::Start(footer.bitmap_offset))?;
        let mut data = vec![0u8; footer.bitmap_len as usize];
        file.read_exact(&mut data)?;

        let (body, mut crc) = data.split_at(data.len() - 4);
        let expected = crc.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(QuiverError::ChecksumMismatch { expected, actual });
        }
        RoaringTreemap::deserialize_from(body)
            .map_err(|e| QuiverError::Corruption(format!("Invalid part series bitmap: {}", e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &PartMeta {
        &self.meta
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// IDs of all series stored in this part
    pub fn series_ids(&self) -> &RoaringTreemap {
        &self.series
    }

    pub fn contains_series(&self, series_id: SeriesId) -> bool {
        self.series.contains(series_id)
    }

    /// Every block index entry, in file order
    pub fn block_refs(&self) -> &[BlockRef] {
        &self.index
    }

    /// Block index entries of one series, ascending by time
    pub fn blocks_for(&self, series_id: SeriesId) -> &[BlockRef] {
        let start = self.index.partition_point(|b| b.series_id < series_id);
        let end = start + self.index[start..].partition_point(|b| b.series_id == series_id);
        &self.index[start..end]
    }

    /// Read and decode one block
    pub fn read_block(&self, entry: &BlockRef) -> Result<Block> {
        let mut data = vec![0u8; entry.size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut data)?;
        }

        let block = Block::decode(&data)?;
        if block.series_id != entry.series_id || block.len() != entry.count as usize {
            return Err(QuiverError::Corruption(format!(
                "Block at {} does not match its index entry",
                entry.offset
            )));
        }
        Ok(block)
    }

    /// Samples of one series within `range`, or `None` if there are none
    pub fn read_series(&self, series_id: SeriesId, range: &TimeRange) -> Result<Option<SeriesColumns>> {
        if !self.contains_series(series_id) || !self.meta.overlaps(range) {
            return Ok(None);
        }

        let mut timestamps = Vec::new();
        let mut values = Vec::new();
        for entry in self.blocks_for(series_id).iter().filter(|b| b.overlaps(range)) {
            let block = self.read_block(entry)?;
            for (ts, v) in block.timestamps.into_iter().zip(block.values) {
                if range.contains(ts) {
                    timestamps.push(ts);
                    values.push(v);
                }
            }
        }

        if timestamps.is_empty() {
            return Ok(None);
        }
        Ok(Some(SeriesColumns {
            series_id,
            timestamps,
            values,
        }))
    }

    /// Every series in ID order, with all of its samples
    pub fn iter_series(&self) -> impl Iterator<Item = Result<SeriesColumns>> + '_ {
        self.series
            .iter()
            .filter_map(move |id| self.read_series(id, &TimeRange::all()).transpose())
    }

    /// Decode every block, returning the first error
    pub fn verify(&self) -> Result<()> {
        for entry in &self.index {
            self.read_block(entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::BlockCompression;
    use crate::part::{part_path, PartConfig, PartWriter};
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn config(max_rows_per_block: usize) -> PartConfig {
        PartConfig {
            max_rows_per_block,
            compression: BlockCompression::Lz4,
        }
    }

    fn write_part(dir: &Path, id: u64, max_rows_per_block: usize) -> PartMeta {
        let mut writer = PartWriter::create(&dir.join("tmp"), id, 0, config(max_rows_per_block)).unwrap();
        for series in [2u64, 5, 9] {
            let ts: Vec<i64> = (0..250).map(|i| 1_000 + i * 100).collect();
            let vals: Vec<f64> = (0..250).map(|i| series as f64 * 1000.0 + i as f64).collect();
            writer.add_series(series, &ts, &vals).unwrap();
        }
        writer.finish(&dir.join("parts")).unwrap()
    }

    #[test]
    fn test_write_and_read_part() {
        let dir = TempDir::new().unwrap();
        let meta = write_part(dir.path(), 7, 100);
        assert_eq!(meta.rows, 750);
        assert_eq!(meta.series, 3);
        assert_eq!(meta.min_timestamp, 1_000);
        assert_eq!(meta.max_timestamp, 1_000 + 249 * 100);

        let reader = PartReader::open(&part_path(&dir.path().join("parts"), 7)).unwrap();
        assert_eq!(reader.meta(), &meta);
        assert_eq!(reader.series_ids().iter().collect::<Vec<_>>(), vec![2, 5, 9]);
        assert_eq!(reader.blocks_for(5).len(), 3);
        assert!(reader.blocks_for(6).is_empty());

        let cols = reader.read_series(5, &TimeRange::new(10_000, 12_000)).unwrap().unwrap();
        assert_eq!(cols.timestamps, (90..=110).map(|i| 1_000 + i * 100).collect::<Vec<i64>>());
        assert_eq!(cols.values[0], 5090.0);

        assert!(reader.read_series(6, &TimeRange::all()).unwrap().is_none());
        assert!(reader.read_series(5, &TimeRange::new(0, 999)).unwrap().is_none());
        assert_eq!(reader.iter_series().count(), 3);
        reader.verify().unwrap();

        assert!(!dir.path().join("tmp").join("0000000000000007.part").exists());
    }

    #[test]
    fn test_header_and_footer_layout() {
        let dir = TempDir::new().unwrap();
        let mut writer = PartWriter::create(&dir.path().join("tmp"), 42, 3, config(100)).unwrap();
        writer.add_series(1, &[10, 20], &[1.0, 2.0]).unwrap();
        writer.finish(&dir.path().join("parts")).unwrap();

        let data = fs::read(part_path(&dir.path().join("parts"), 42)).unwrap();
        assert_eq!(&data[..4], MAGIC);
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), FORMAT_VERSION);
        assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 42);

        let footer = &data[data.len() - FOOTER_SIZE..];
        assert_eq!(&footer[72..], MAGIC);
        assert_eq!(u32::from_le_bytes(footer[68..72].try_into().unwrap()), crc32fast::hash(&footer[..68]));
        assert_eq!(u32::from_le_bytes(footer[64..68].try_into().unwrap()), 3);
        assert_eq!(i64::from_le_bytes(footer[48..56].try_into().unwrap()), 10);
        assert_eq!(i64::from_le_bytes(footer[56..64].try_into().unwrap()), 20);

        assert_eq!(PartReader::open(&part_path(&dir.path().join("parts"), 42)).unwrap().meta().level, 3);
    }

    #[test]
    fn test_corrupt_block_detected() {
        let dir = TempDir::new().unwrap();
        write_part(dir.path(), 1, 1000);
        let path = part_path(&dir.path().join("parts"), 1);

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 60] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let reader = PartReader::open(&path).unwrap();
        let err = reader.read_series(2, &TimeRange::all()).unwrap_err();
        assert!(err.is_corruption());
        assert!(reader.verify().is_err());
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        let dir = TempDir::new().unwrap();
        write_part(dir.path(), 1, 1000);
        let path = part_path(&dir.path().join("parts"), 1);

        let mut bytes = fs::read(&path).unwrap();
        let at = bytes.len() - FOOTER_SIZE + 3;
        bytes[at] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(PartReader::open(&path).unwrap_err().is_corruption());

        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"QPRT").unwrap();
        assert!(PartReader::open(&path).is_err());
    }

    #[test]
    fn test_unfinished_writer_cleans_up() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("tmp");
        {
            let mut writer = PartWriter::create(&tmp, 3, 0, config(10)).unwrap();
            writer.add_series(1, &[1, 2], &[1.0, 2.0]).unwrap();
            assert!(writer.add_series(1, &[3], &[3.0]).is_err());
            assert!(writer.add_series(0, &[3], &[3.0]).is_err());
            assert!(writer.add_series(4, &[3, 3], &[3.0, 1.0]).is_err());
        }
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_part() {
        let dir = TempDir::new().unwrap();
        let writer = PartWriter::create(&dir.path().join("tmp"), 4, 1, config(10)).unwrap();
        assert!(writer.is_empty());
        let meta = writer.finish(&dir.path().join("parts")).unwrap();
        assert_eq!(meta.rows, 0);

        let reader = PartReader::open(&part_path(&dir.path().join("parts"), 4)).unwrap();
        assert_eq!(reader.meta().level, 1);
        assert!(reader.series_ids().is_empty());
        assert!(reader.read_series(1, &TimeRange::all()).unwrap().is_none());
    }
}
