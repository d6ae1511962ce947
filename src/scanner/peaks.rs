//! Per-bucket min/max/RMS accumulation over interleaved sample frames.

use super::source::AudioChunk;
use crate::waveform::{BUCKET_COUNT, MAX_CHANNELS, WaveformData};

const CHANNELS: usize = MAX_CHANNELS as usize;

/// Samples each bucket consumes: `max(1, floor(duration * rate) / BUCKET_COUNT)`.
pub fn samples_per_bucket(duration: f64, sample_rate: u32) -> usize {
    let total = (duration * sample_rate as f64).max(0.0) as u64;
    ((total / BUCKET_COUNT as u64) as usize).max(1)
}

/// Running accumulator that writes finished buckets straight into an envelope.
///
/// Channels the envelope has but a chunk lacks are left untouched (zero).
/// Channels beyond the envelope's are ignored.
#[derive(Debug)]
pub struct PeakAccumulator {
    channels: usize,
    samples_per_bucket: usize,
    bucket: usize,
    count: usize,
    min: [f32; CHANNELS],
    max: [f32; CHANNELS],
    sum_sq: [f64; CHANNELS],
}

impl PeakAccumulator {
    pub fn new(channels: u32, samples_per_bucket: usize) -> Self {
        Self {
            channels: (channels as usize).min(CHANNELS),
            samples_per_bucket: samples_per_bucket.max(1),
            bucket: 0,
            count: 0,
            min: [0.0; CHANNELS],
            max: [0.0; CHANNELS],
            sum_sq: [0.0; CHANNELS],
        }
    }

    /// Buckets finalized so far.
    pub fn buckets_filled(&self) -> usize {
        self.bucket
    }

    pub fn is_full(&self) -> bool {
        self.bucket >= BUCKET_COUNT
    }

    /// Fold one chunk into the envelope. Frames past the last bucket are dropped.
    pub fn feed(&mut self, chunk: &AudioChunk, out: &mut WaveformData) {
        let stride = chunk.channels as usize;
        if stride == 0 {
            return;
        }
        let used = self.channels.min(stride);

        for frame in chunk.samples.chunks_exact(stride) {
            if self.is_full() {
                return;
            }
            for (ch, &raw) in frame.iter().take(used).enumerate() {
                // NaN and infinities count as silence
                let s = if raw.is_finite() { raw } else { 0.0 };
                self.min[ch] = self.min[ch].min(s);
                self.max[ch] = self.max[ch].max(s);
                self.sum_sq[ch] += f64::from(s) * f64::from(s);
            }
            self.count += 1;
            if self.count >= self.samples_per_bucket {
                self.flush(out);
            }
        }
    }

    /// Finalize a partially filled last bucket. Returns the buckets written.
    pub fn finish(mut self, out: &mut WaveformData) -> usize {
        if self.count > 0 && !self.is_full() {
            self.flush(out);
        }
        self.bucket
    }

    fn flush(&mut self, out: &mut WaveformData) {
        let i = self.bucket;
        for ch in 0..self.channels {
            if let Some(slot) = out.min[ch].get_mut(i) {
                *slot = self.min[ch];
            }
            if let Some(slot) = out.max[ch].get_mut(i) {
                *slot = self.max[ch];
            }
            if let Some(slot) = out.rms[ch].get_mut(i) {
                *slot = (self.sum_sq[ch] / self.count as f64).sqrt() as f32;
            }
        }
        self.bucket += 1;
        self.count = 0;
        self.min = [0.0; CHANNELS];
        self.max = [0.0; CHANNELS];
        self.sum_sq = [0.0; CHANNELS];
    }
}
