//! Capabilities the scanner needs from whatever decodes audio.

use thiserror::Error;

use super::AbortSignal;
use crate::track::TrackHandle;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("No decodable audio track (subsong {0})")]
    NoAudioTrack(u32),
    #[error("Decoder error: {0}")]
    Decoder(String),
    #[error("Decode aborted")]
    Aborted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream properties as reported by the host; any of them may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamInfo {
    /// Seconds
    pub duration: Option<f64>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

impl StreamInfo {
    /// Fill fields this one lacks from `fallback`.
    pub fn or(self, fallback: StreamInfo) -> StreamInfo {
        StreamInfo {
            duration: self.duration.or(fallback.duration),
            channels: self.channels.or(fallback.channels),
            sample_rate: self.sample_rate.or(fallback.sample_rate),
        }
    }
}

/// One block of decoded audio, interleaved `[f0c0, f0c1, f1c0, ...]`.
#[derive(Debug, Clone, Default)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub channels: u32,
}

impl AudioChunk {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Metadata lookup and decoder construction for tracks.
pub trait AudioBackend: Send + Sync {
    /// Duration, channel count and sample rate, without decoding audio.
    fn probe(&self, track: &TrackHandle) -> Result<StreamInfo, DecodeError>;

    /// Open a raw decode stream positioned at the start of the track.
    fn open(
        &self,
        track: &TrackHandle,
        abort: &AbortSignal,
    ) -> Result<Box<dyn DecodeStream>, DecodeError>;
}

/// A decoder being drained front to back.
pub trait DecodeStream: Send {
    /// Next decoded block, `Ok(None)` at end of stream.
    ///
    /// Implementations return `DecodeError::Aborted` once `abort` is raised.
    fn next_chunk(&mut self, abort: &AbortSignal) -> Result<Option<AudioChunk>, DecodeError>;
}
