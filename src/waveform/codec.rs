//! Versioned binary layout and compression for [`WaveformData`].
//!
//! Serialized layout, all little-endian:
//!
//! ```text
//! u32 version | u32 channel_count | u32 sample_rate | f64 duration
//! per channel: f32 min[BUCKET_COUNT], f32 max[BUCKET_COUNT], f32 rms[BUCKET_COUNT]
//! ```
//!
//! Compressed blobs are `u32 uncompressed_len` followed by a zlib stream of the
//! serialized bytes. The layout is persisted in the cache, so field order and
//! byte order must never change without bumping [`FORMAT_VERSION`].

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

use super::{BUCKET_COUNT, MAX_CHANNELS, WaveformData};

pub const FORMAT_VERSION: u32 = 1;

/// version + channel_count + sample_rate + duration
pub const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Upper bound on a declared uncompressed size (a stereo envelope is ~49 KiB).
pub const MAX_UNCOMPRESSED_LEN: usize = 1024 * 1024;

const SIZE_PREFIX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("buffer too short: {len} bytes, need {needed}")]
    Truncated { len: usize, needed: usize },
    #[error("unsupported format version {0}")]
    Version(u32),
    #[error("invalid channel count {0}")]
    ChannelCount(u32),
    #[error("envelope is not valid and cannot be encoded")]
    InvalidEnvelope,
    #[error("declared uncompressed size {0} out of bounds")]
    DeclaredSize(usize),
    #[error("inflated {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("compression stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exact serialized size for an envelope with `channels` channels.
pub fn serialized_len(channels: u32) -> usize {
    HEADER_LEN + channels as usize * 3 * BUCKET_COUNT * std::mem::size_of::<f32>()
}

impl WaveformData {
    /// Serialize into a fresh buffer of exactly [`serialized_len`] bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    /// Serialize into `out`, replacing its contents.
    ///
    /// Arrays shorter than `BUCKET_COUNT` are padded with zeros so the output
    /// length only depends on the channel count.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        let channels = self.channel_count.min(MAX_CHANNELS);
        out.clear();
        out.reserve(serialized_len(channels));

        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.duration.to_le_bytes());

        for ch in 0..channels as usize {
            for values in [&self.min[ch], &self.max[ch], &self.rms[ch]] {
                for i in 0..BUCKET_COUNT {
                    let v = values.get(i).copied().unwrap_or(0.0);
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    /// Parse a serialized envelope. Trailing bytes past the expected size are ignored.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = LeReader::new(bytes);
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated { len: bytes.len(), needed: HEADER_LEN });
        }

        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(CodecError::Version(version));
        }
        let channel_count = reader.u32()?;
        if channel_count == 0 || channel_count > MAX_CHANNELS {
            return Err(CodecError::ChannelCount(channel_count));
        }
        let sample_rate = reader.u32()?;
        let duration = reader.f64()?;

        let needed = serialized_len(channel_count);
        if bytes.len() < needed {
            return Err(CodecError::Truncated { len: bytes.len(), needed });
        }

        let mut data = WaveformData {
            channel_count,
            sample_rate,
            duration,
            ..Default::default()
        };
        for ch in 0..channel_count as usize {
            data.min[ch] = reader.f32_array(BUCKET_COUNT)?;
            data.max[ch] = reader.f32_array(BUCKET_COUNT)?;
            data.rms[ch] = reader.f32_array(BUCKET_COUNT)?;
        }
        Ok(data)
    }

    /// Serialize and zlib-compress, prefixed with the uncompressed length.
    pub fn compress(&self) -> Result<Vec<u8>, CodecError> {
        if !self.is_valid() {
            return Err(CodecError::InvalidEnvelope);
        }
        let raw = self.serialize();

        let mut out = Vec::with_capacity(raw.len() / 2);
        out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        let mut encoder = ZlibEncoder::new(out, Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    /// Inverse of [`WaveformData::compress`]; `None` for any malformed blob.
    pub fn decompress(blob: &[u8]) -> Option<Self> {
        match Self::try_decompress(blob) {
            Ok(data) => Some(data),
            Err(e) => {
                log::debug!("Rejected waveform blob ({} bytes): {}", blob.len(), e);
                None
            }
        }
    }

    pub fn try_decompress(blob: &[u8]) -> Result<Self, CodecError> {
        if blob.len() <= SIZE_PREFIX_LEN {
            return Err(CodecError::Truncated { len: blob.len(), needed: SIZE_PREFIX_LEN + 1 });
        }
        let declared = LeReader::new(blob).u32()? as usize;
        if declared == 0 || declared > MAX_UNCOMPRESSED_LEN {
            return Err(CodecError::DeclaredSize(declared));
        }

        // Read at most one byte past the declared size so an oversized stream
        // is detected without inflating all of it.
        let mut raw = Vec::with_capacity(declared);
        ZlibDecoder::new(&blob[SIZE_PREFIX_LEN..])
            .take(declared as u64 + 1)
            .read_to_end(&mut raw)?;
        if raw.len() != declared {
            return Err(CodecError::SizeMismatch { expected: declared, actual: raw.len() });
        }

        Self::deserialize(&raw)
    }
}

/// Cursor over a little-endian byte buffer.
struct LeReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> LeReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.offset + N;
        let slice = self.bytes.get(self.offset..end).ok_or(CodecError::Truncated {
            len: self.bytes.len(),
            needed: end,
        })?;
        self.offset = end;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    fn f32_array(&mut self, count: usize) -> Result<Vec<f32>, CodecError> {
        (0..count)
            .map(|_| Ok(f32::from_le_bytes(self.take()?)))
            .collect()
    }
}
