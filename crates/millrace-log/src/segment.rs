//! File-backed log storage with rolling segment files.
//!
//! Stands in for the replication layer on single-node deployments and in
//! tests: appends are made durable with fdatasync before their future
//! completes. Each block is stored as
//! `[length: 4][crc32c: 4][last_position: 8][frames...]` with the checksum
//! covering everything after the header. On open, segments are scanned,
//! torn writes are truncated, and the block index is rebuilt. Compaction
//! deletes whole segment files whose records are all at or below the
//! compaction position.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use millrace_core::ActorFuture;
use parking_lot::Mutex;

use crate::storage::{LogStorage, LogStorageError, StorageBlock, StorageReader};

/// Size of the block header (length + CRC32C).
const BLOCK_HEADER_SIZE: u64 = 8;

/// Size of the per-block position prefix inside the checksummed data.
const POSITION_PREFIX_SIZE: usize = 8;

/// Configuration for [`SegmentStorage`].
#[derive(Debug, Clone)]
pub struct SegmentStorageConfig {
    /// Roll to a new segment file once the active one exceeds this size.
    pub max_segment_bytes: u64,
}

impl Default for SegmentStorageConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

#[derive(Debug, Clone)]
struct BlockMeta {
    index: u64,
    last_position: i64,
    /// Byte offset of the block data (past the header) within its segment.
    data_offset: u64,
    data_len: u64,
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    blocks: Vec<BlockMeta>,
    len: u64,
}

struct SegmentSet {
    segments: Vec<Segment>,
    writer: BufWriter<File>,
    next_index: u64,
    next_segment_id: u64,
}

/// File-backed [`LogStorage`] with rolling segments.
pub struct SegmentStorage {
    dir: PathBuf,
    config: SegmentStorageConfig,
    inner: Arc<Mutex<SegmentSet>>,
}

impl SegmentStorage {
    /// Opens (or creates) segment storage in `dir`, recovering the block
    /// index and truncating any torn write at the tail.
    ///
    /// # Errors
    ///
    /// Returns a [`LogStorageError`] if the directory cannot be read or a
    /// segment cannot be recovered.
    pub fn open(dir: &Path, config: SegmentStorageConfig) -> Result<Self, LogStorageError> {
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "log")
                    && path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .is_some_and(|stem| stem.starts_with("segment-"))
            })
            .collect();
        paths.sort();

        let mut segments = Vec::new();
        let mut next_index = 0;
        for path in paths {
            let segment = Self::recover_segment(&path, &mut next_index)?;
            segments.push(segment);
        }

        let next_segment_id = segments
            .last()
            .and_then(|segment| parse_segment_id(&segment.path))
            .map_or(0, |id| id + 1);

        // Append to the last segment if present, otherwise start fresh.
        let (active_path, created) = match segments.last() {
            Some(segment) => (segment.path.clone(), false),
            None => (segment_path(dir, 0), true),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)
            .map_err(io_err)?;
        if created {
            segments.push(Segment {
                path: active_path,
                blocks: Vec::new(),
                len: 0,
            });
        }

        tracing::info!(
            dir = %dir.display(),
            segments = segments.len(),
            next_index,
            "segment storage opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            inner: Arc::new(Mutex::new(SegmentSet {
                segments,
                writer: BufWriter::with_capacity(64 * 1024, file),
                next_index,
                next_segment_id: next_segment_id.max(1),
            })),
        })
    }

    /// Scans one segment, truncating at the first torn or corrupt block.
    fn recover_segment(path: &Path, next_index: &mut u64) -> Result<Segment, LogStorageError> {
        let mut file = File::open(path).map_err(io_err)?;
        let file_len = file.metadata().map_err(io_err)?.len();

        let mut blocks = Vec::new();
        let mut offset = 0u64;
        let mut valid_end = 0u64;

        loop {
            let remaining = file_len.saturating_sub(offset);
            if remaining == 0 {
                break;
            }
            if remaining < BLOCK_HEADER_SIZE {
                tracing::warn!(
                    segment = %path.display(),
                    offset,
                    remaining,
                    "torn block header, truncating"
                );
                break;
            }

            let mut header = [0u8; 8];
            file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
            file.read_exact(&mut header).map_err(io_err)?;
            let len = u64::from(u32::from_le_bytes([
                header[0], header[1], header[2], header[3],
            ]));
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if file_len.saturating_sub(offset + BLOCK_HEADER_SIZE) < len {
                tracing::warn!(
                    segment = %path.display(),
                    offset,
                    "torn block data, truncating"
                );
                break;
            }

            #[allow(clippy::cast_possible_truncation)] // len < file size
            let mut data = vec![0u8; len as usize];
            file.read_exact(&mut data).map_err(io_err)?;

            let actual_crc = crc32c::crc32c(&data);
            if actual_crc != expected_crc {
                tracing::warn!(
                    segment = %path.display(),
                    offset,
                    "block checksum mismatch, truncating"
                );
                break;
            }
            if data.len() < POSITION_PREFIX_SIZE {
                tracing::warn!(
                    segment = %path.display(),
                    offset,
                    "block shorter than position prefix, truncating"
                );
                break;
            }

            let last_position = i64::from_le_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]);

            blocks.push(BlockMeta {
                index: *next_index,
                last_position,
                data_offset: offset + BLOCK_HEADER_SIZE,
                data_len: len,
            });
            *next_index += 1;
            offset += BLOCK_HEADER_SIZE + len;
            valid_end = offset;
        }

        if valid_end < file_len {
            let writable = OpenOptions::new().write(true).open(path).map_err(io_err)?;
            writable.set_len(valid_end).map_err(io_err)?;
            writable.sync_data().map_err(io_err)?;
        }

        Ok(Segment {
            path: path.to_path_buf(),
            blocks,
            len: valid_end,
        })
    }

    fn roll_segment(&self, set: &mut SegmentSet) -> Result<(), LogStorageError> {
        let path = segment_path(&self.dir, set.next_segment_id);
        set.next_segment_id += 1;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        set.writer = BufWriter::with_capacity(64 * 1024, file);
        set.segments.push(Segment {
            path: path.clone(),
            blocks: Vec::new(),
            len: 0,
        });
        tracing::debug!(segment = %path.display(), "rolled to new segment");
        Ok(())
    }

    fn append_inner(&self, last_position: i64, block: &[u8]) -> Result<u64, LogStorageError> {
        let mut set = self.inner.lock();

        let mut data = Vec::with_capacity(POSITION_PREFIX_SIZE + block.len());
        data.extend_from_slice(&last_position.to_le_bytes());
        data.extend_from_slice(block);

        let crc = crc32c::crc32c(&data);
        #[allow(clippy::cast_possible_truncation)] // block size bounded by append batch config
        let len = data.len() as u32;

        set.writer.write_all(&len.to_le_bytes()).map_err(io_err)?;
        set.writer.write_all(&crc.to_le_bytes()).map_err(io_err)?;
        set.writer.write_all(&data).map_err(io_err)?;
        set.writer.flush().map_err(io_err)?;
        // fdatasync before acknowledging durability
        set.writer.get_ref().sync_data().map_err(io_err)?;

        let index = set.next_index;
        set.next_index += 1;

        let data_len = data.len() as u64;
        let segment = set
            .segments
            .last_mut()
            .ok_or_else(|| LogStorageError::Io("no active segment".to_string()))?;
        segment.blocks.push(BlockMeta {
            index,
            last_position,
            data_offset: segment.len + BLOCK_HEADER_SIZE,
            data_len,
        });
        segment.len += BLOCK_HEADER_SIZE + data_len;

        if segment.len >= self.config.max_segment_bytes {
            self.roll_segment(&mut set)?;
        }

        Ok(index)
    }
}

impl LogStorage for SegmentStorage {
    fn append(
        &self,
        last_position: i64,
        block: Vec<u8>,
    ) -> ActorFuture<Result<u64, LogStorageError>> {
        ActorFuture::completed(self.append_inner(last_position, &block))
    }

    fn compact(&self, up_to_position: i64) -> Result<(), LogStorageError> {
        let mut set = self.inner.lock();
        let total = set.segments.len();
        let mut removed = 0;

        // Never delete the active (last) segment.
        while set.segments.len() > 1 {
            let fully_compactable = set.segments[0]
                .blocks
                .iter()
                .all(|block| block.last_position <= up_to_position);
            if !fully_compactable {
                break;
            }
            let segment = set.segments.remove(0);
            std::fs::remove_file(&segment.path).map_err(io_err)?;
            tracing::info!(segment = %segment.path.display(), "deleted compacted segment");
            removed += 1;
        }

        tracing::debug!(up_to_position, removed, retained = total - removed, "compacted");
        Ok(())
    }

    fn open_reader(&self) -> Box<dyn StorageReader> {
        Box::new(SegmentReader {
            inner: Arc::clone(&self.inner),
            next_index: 0,
        })
    }

    fn last_durable_position(&self) -> Option<i64> {
        let set = self.inner.lock();
        set.segments
            .iter()
            .rev()
            .find_map(|segment| segment.blocks.last().map(|b| b.last_position))
    }
}

impl std::fmt::Debug for SegmentStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.inner.lock();
        f.debug_struct("SegmentStorage")
            .field("dir", &self.dir)
            .field("segments", &set.segments.len())
            .field("next_index", &set.next_index)
            .finish_non_exhaustive()
    }
}

struct SegmentReader {
    inner: Arc<Mutex<SegmentSet>>,
    next_index: u64,
}

impl SegmentReader {
    fn locate(&self, index: u64) -> Option<(PathBuf, BlockMeta)> {
        let set = self.inner.lock();
        for segment in &set.segments {
            for block in &segment.blocks {
                if block.index >= index {
                    return Some((segment.path.clone(), block.clone()));
                }
            }
        }
        None
    }
}

impl StorageReader for SegmentReader {
    fn seek(&mut self, position: i64) {
        let set = self.inner.lock();
        for segment in &set.segments {
            for block in &segment.blocks {
                if block.last_position >= position {
                    self.next_index = block.index;
                    return;
                }
            }
        }
        self.next_index = set.next_index;
    }

    fn next_block(&mut self) -> Result<Option<StorageBlock>, LogStorageError> {
        let Some((path, meta)) = self.locate(self.next_index) else {
            return Ok(None);
        };

        let mut file = File::open(&path).map_err(io_err)?;
        file.seek(SeekFrom::Start(meta.data_offset)).map_err(io_err)?;
        #[allow(clippy::cast_possible_truncation)] // block size bounded by append batch config
        let mut data = vec![0u8; meta.data_len as usize];
        file.read_exact(&mut data).map_err(io_err)?;

        self.next_index = meta.index + 1;
        Ok(Some(StorageBlock {
            index: meta.index,
            last_position: meta.last_position,
            // Strip the position prefix; callers see the raw frames.
            data: data.split_off(POSITION_PREFIX_SIZE),
        }))
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("segment-{id:08}.log"))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("segment-")?
        .parse()
        .ok()
}

fn io_err(error: std::io::Error) -> LogStorageError {
    LogStorageError::Io(error.to_string())
}
