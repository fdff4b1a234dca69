//! Record framing: `[length: 4][crc32c: 4][data: length]`.

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;

use crate::record::Record;

/// Size of the frame header (length + CRC32C).
pub const RECORD_FRAME_HEADER_SIZE: usize = 8;

/// Errors from encoding or decoding record frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Record serialization failed.
    #[error("record serialization failed: {0}")]
    Serialization(String),

    /// Record deserialization failed.
    #[error("record deserialization failed at offset {offset}: {message}")]
    Deserialization {
        /// Byte offset of the frame within the block.
        offset: usize,
        /// Error message.
        message: String,
    },

    /// A frame's checksum did not match its data.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Byte offset of the frame within the block.
        offset: usize,
        /// Checksum stored in the frame header.
        expected: u32,
        /// Checksum computed over the frame data.
        actual: u32,
    },

    /// The block ends in the middle of a frame.
    #[error("truncated frame at offset {offset}: {remaining} bytes remaining, need {needed}")]
    Truncated {
        /// Byte offset of the incomplete frame.
        offset: usize,
        /// Bytes remaining in the block.
        remaining: usize,
        /// Bytes required to complete the frame.
        needed: usize,
    },
}

/// Encodes a record as one frame.
///
/// # Errors
///
/// Returns [`FrameError::Serialization`] if the record cannot be
/// serialized.
pub fn encode_record(record: &Record) -> Result<Vec<u8>, FrameError> {
    let bytes: AlignedVec = rkyv::to_bytes::<RkyvError>(record)
        .map_err(|e| FrameError::Serialization(e.to_string()))?;

    let crc = crc32c::crc32c(&bytes);

    #[allow(clippy::cast_possible_truncation)] // rkyv record size is well below u32::MAX
    let len = bytes.len() as u32;

    let mut frame = Vec::with_capacity(RECORD_FRAME_HEADER_SIZE + bytes.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

/// Sequential decoder over a block of concatenated frames.
#[derive(Debug)]
pub struct FrameCursor<'a> {
    block: &'a [u8],
    offset: usize,
}

impl<'a> FrameCursor<'a> {
    /// Creates a cursor over a block.
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self { block, offset: 0 }
    }

    /// Returns the current byte offset within the block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Decodes the next record, or returns `None` at the end of the block.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on truncation, checksum mismatch, or
    /// deserialization failure.
    #[allow(clippy::should_implement_trait)] // Fallible iteration, not Iterator
    pub fn next(&mut self) -> Result<Option<Record>, FrameError> {
        let remaining = self.block.len() - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < RECORD_FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                offset: self.offset,
                remaining,
                needed: RECORD_FRAME_HEADER_SIZE,
            });
        }

        let frame_start = self.offset;
        let header = &self.block[self.offset..self.offset + RECORD_FRAME_HEADER_SIZE];
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let data_start = frame_start + RECORD_FRAME_HEADER_SIZE;
        if self.block.len() - data_start < len {
            return Err(FrameError::Truncated {
                offset: frame_start,
                remaining: self.block.len() - data_start,
                needed: len,
            });
        }

        let data = &self.block[data_start..data_start + len];
        let actual_crc = crc32c::crc32c(data);
        if actual_crc != expected_crc {
            return Err(FrameError::ChecksumMismatch {
                offset: frame_start,
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        // Copy into an aligned buffer before deserializing.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let record = rkyv::from_bytes::<Record, RkyvError>(&aligned).map_err(|e| {
            FrameError::Deserialization {
                offset: frame_start,
                message: e.to_string(),
            }
        })?;

        self.offset = data_start + len;
        Ok(Some(record))
    }
}
