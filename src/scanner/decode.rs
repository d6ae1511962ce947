//! Symphonia-backed implementation of the decoding capabilities.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::metadata;
use super::source::{AudioBackend, AudioChunk, DecodeError, DecodeStream, StreamInfo};
use super::AbortSignal;
use crate::track::TrackHandle;

/// Decodes local files with symphonia, using container tags as a fallback
/// for properties the codec parameters leave out.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaBackend;

impl SymphoniaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for SymphoniaBackend {
    fn probe(&self, track: &TrackHandle) -> Result<StreamInfo, DecodeError> {
        let from_codec = match open_format(track.path()) {
            Ok(format) => {
                let (_, params) = select_track(format.as_ref(), track.subsong())?;
                info_from_params(&params)
            }
            Err(e) => {
                log::debug!("Symphonia could not probe {}: {}", track.path().display(), e);
                StreamInfo::default()
            }
        };

        if from_codec.duration.is_some() && from_codec.channels.is_some() {
            return Ok(from_codec);
        }
        Ok(from_codec.or(metadata::read_stream_info(track.path())))
    }

    fn open(
        &self,
        track: &TrackHandle,
        abort: &AbortSignal,
    ) -> Result<Box<dyn DecodeStream>, DecodeError> {
        if abort.is_aborted() {
            return Err(DecodeError::Aborted);
        }
        let format = open_format(track.path())?;
        let (track_id, params) = select_track(format.as_ref(), track.subsong())?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::UnsupportedFormat(e.to_string()))?;

        Ok(Box::new(SymphoniaStream {
            format,
            decoder,
            track_id,
        }))
    }
}

struct SymphoniaStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
}

impl DecodeStream for SymphoniaStream {
    fn next_chunk(&mut self, abort: &AbortSignal) -> Result<Option<AudioChunk>, DecodeError> {
        loop {
            if abort.is_aborted() {
                return Err(DecodeError::Aborted);
            }

            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphError::ResetRequired) => return Ok(None),
                Err(e) => return Err(DecodeError::Decoder(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let num_frames = decoded.frames();
                    if num_frames == 0 {
                        continue;
                    }
                    let mut sample_buf = SampleBuffer::<f32>::new(num_frames as u64, spec);
                    sample_buf.copy_interleaved_ref(decoded);
                    return Ok(Some(AudioChunk {
                        samples: sample_buf.samples().to_vec(),
                        channels: spec.channels.count() as u32,
                    }));
                }
                Err(SymphError::DecodeError(e)) => {
                    log::debug!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(SymphError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(DecodeError::Decoder(e.to_string())),
            }
        }
    }
}

fn open_format(path: &Path) -> Result<Box<dyn FormatReader>, DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::UnsupportedFormat(e.to_string()))?;

    Ok(probed.format)
}

/// The `subsong`-th decodable track of the container.
fn select_track(
    format: &dyn FormatReader,
    subsong: u32,
) -> Result<(u32, CodecParameters), DecodeError> {
    format
        .tracks()
        .iter()
        .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .nth(subsong as usize)
        .map(|t| (t.id, t.codec_params.clone()))
        .ok_or(DecodeError::NoAudioTrack(subsong))
}

fn info_from_params(params: &CodecParameters) -> StreamInfo {
    let sample_rate = params.sample_rate.filter(|&r| r > 0);
    let duration = match (params.n_frames, sample_rate) {
        (Some(frames), Some(rate)) if frames > 0 => Some(frames as f64 / rate as f64),
        _ => None,
    };
    StreamInfo {
        duration,
        channels: params.channels.map(|c| c.count() as u32).filter(|&c| c > 0),
        sample_rate,
    }
}
