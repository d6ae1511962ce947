pub mod codec;

pub use codec::CodecError;

/// Number of fixed time-slices every envelope is divided into.
pub const BUCKET_COUNT: usize = 2048;

/// Highest channel count an envelope keeps (mono or stereo).
pub const MAX_CHANNELS: u32 = 2;

/// Per-bucket amplitude envelope of a whole track.
///
/// Bucket `i` covers `[i / BUCKET_COUNT, (i + 1) / BUCKET_COUNT) * duration`.
/// For every channel below `channel_count`, `min`, `max` and `rms` hold exactly
/// `BUCKET_COUNT` values with `min <= 0 <= max` and `rms >= 0`.
///
/// `WaveformData::default()` is the empty envelope handed to callers when no
/// data is available; it is never valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveformData {
    pub channel_count: u32,
    pub sample_rate: u32,
    /// Track duration in seconds.
    pub duration: f64,
    pub min: [Vec<f32>; 2],
    pub max: [Vec<f32>; 2],
    pub rms: [Vec<f32>; 2],
}

impl WaveformData {
    /// Allocated, zero-filled envelope for `channels` (capped at 2).
    pub fn new(channels: u32, sample_rate: u32, duration: f64) -> Self {
        let mut data = Self::default();
        data.initialize(channels, sample_rate, duration);
        data
    }

    /// Reset the header and allocate zeroed bucket arrays.
    pub fn initialize(&mut self, channels: u32, sample_rate: u32, duration: f64) {
        self.channel_count = channels.min(MAX_CHANNELS);
        self.sample_rate = sample_rate;
        self.duration = duration;

        for ch in 0..MAX_CHANNELS as usize {
            let len = if ch < self.channel_count as usize { BUCKET_COUNT } else { 0 };
            self.min[ch] = vec![0.0; len];
            self.max[ch] = vec![0.0; len];
            self.rms[ch] = vec![0.0; len];
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return false;
        }
        if self.sample_rate == 0 || self.duration.is_nan() || self.duration <= 0.0 {
            return false;
        }
        (0..self.channel_count as usize).all(|ch| {
            self.min[ch].len() == BUCKET_COUNT
                && self.max[ch].len() == BUCKET_COUNT
                && self.rms[ch].len() == BUCKET_COUNT
        })
    }

    /// Approximate in-memory footprint in bytes (struct plus bucket storage).
    pub fn memory_size(&self) -> usize {
        let arrays: usize = (0..MAX_CHANNELS as usize)
            .map(|ch| {
                self.min[ch].capacity() + self.max[ch].capacity() + self.rms[ch].capacity()
            })
            .sum();
        std::mem::size_of::<Self>() + arrays * std::mem::size_of::<f32>()
    }

    pub fn min_at(&self, channel: u32, position: f64) -> f32 {
        self.sample_at(&self.min, channel, position)
    }

    pub fn max_at(&self, channel: u32, position: f64) -> f32 {
        self.sample_at(&self.max, channel, position)
    }

    pub fn rms_at(&self, channel: u32, position: f64) -> f32 {
        self.sample_at(&self.rms, channel, position)
    }

    /// Rendering lookup: never fails, returns 0.0 for anything out of range.
    fn sample_at(&self, arrays: &[Vec<f32>; 2], channel: u32, position: f64) -> f32 {
        if channel >= self.channel_count {
            return 0.0;
        }
        let Some(values) = arrays.get(channel as usize) else {
            return 0.0;
        };
        if values.is_empty() {
            return 0.0;
        }
        values[bucket_index(position).min(values.len() - 1)]
    }
}

/// Map a normalized position in `[0, 1]` to a bucket index.
///
/// Truncates toward zero; negative and NaN positions land on bucket 0,
/// anything past the end on the last bucket.
pub fn bucket_index(position: f64) -> usize {
    // `as usize` saturates: NaN and negatives become 0.
    let index = (position * (BUCKET_COUNT - 1) as f64) as usize;
    index.min(BUCKET_COUNT - 1)
}
