pub mod abort;
pub mod decode;
pub mod metadata;
pub mod peaks;
pub mod source;

pub use abort::AbortSignal;
pub use decode::SymphoniaBackend;
pub use source::{AudioBackend, AudioChunk, DecodeError, DecodeStream, StreamInfo};

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::dispatch::MainThreadHandle;
use crate::track::TrackHandle;
use crate::waveform::{BUCKET_COUNT, MAX_CHANNELS, WaveformData};
use peaks::PeakAccumulator;

/// Used when the host reports no channel count.
pub const DEFAULT_CHANNELS: u32 = 2;
/// Used when the host reports no sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan cancelled")]
    Cancelled,
    #[error("Invalid track handle")]
    InvalidTrack,
    #[error("No usable duration")]
    NoDuration,
    #[error("Decode error: {0}")]
    Decode(DecodeError),
    #[error("Scan worker failed: {0}")]
    Worker(String),
}

impl From<DecodeError> for ScanError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Aborted => ScanError::Cancelled,
            other => ScanError::Decode(other),
        }
    }
}

/// Terminal result of an asynchronous scan, delivered exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed(WaveformData),
    Cancelled,
    Failed(String),
}

impl ScanOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanOutcome::Cancelled)
    }

    pub fn into_waveform(self) -> Option<WaveformData> {
        match self {
            ScanOutcome::Completed(data) => Some(data),
            _ => None,
        }
    }
}

impl From<Result<WaveformData, ScanError>> for ScanOutcome {
    fn from(result: Result<WaveformData, ScanError>) -> Self {
        match result {
            Ok(data) => ScanOutcome::Completed(data),
            Err(ScanError::Cancelled) => ScanOutcome::Cancelled,
            Err(e) => ScanOutcome::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Scanning,
}

pub type ScanCallback = Box<dyn FnOnce(ScanOutcome) + Send + 'static>;

struct ActiveScan {
    abort: AbortSignal,
    handle: JoinHandle<()>,
}

/// Decodes tracks into envelopes, one background scan at a time.
///
/// Completion callbacks are posted to the main thread through the
/// [`MainThreadHandle`] given at construction; they never run on the worker.
pub struct WaveformScanner {
    backend: Arc<dyn AudioBackend>,
    main: MainThreadHandle,
    scanning: Arc<AtomicBool>,
    active: Mutex<Option<ActiveScan>>,
}

impl WaveformScanner {
    pub fn new(backend: Arc<dyn AudioBackend>, main: MainThreadHandle) -> Self {
        Self {
            backend,
            main,
            scanning: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScannerState {
        if self.is_scanning() {
            ScannerState::Scanning
        } else {
            ScannerState::Idle
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Scan `track` on a worker thread and post `callback` with the outcome.
    ///
    /// A scan already in flight is cancelled and joined first, so its own
    /// callback (with `Cancelled`) is queued before this one starts.
    pub fn scan_async(
        &self,
        track: &TrackHandle,
        callback: impl FnOnce(ScanOutcome) + Send + 'static,
    ) {
        if !track.is_valid() {
            let message = ScanError::InvalidTrack.to_string();
            self.main.post(move || callback(ScanOutcome::Failed(message)));
            return;
        }

        let mut active = self.lock_active();
        if let Some(previous) = active.take() {
            previous.abort.abort();
            if previous.handle.join().is_err() {
                log::warn!("Previous scan worker terminated abnormally");
            }
        }

        let abort = AbortSignal::new();
        let slot: Arc<Mutex<Option<ScanCallback>>> =
            Arc::new(Mutex::new(Some(Box::new(callback))));
        self.scanning.store(true, Ordering::SeqCst);

        let backend = Arc::clone(&self.backend);
        let scanning = Arc::clone(&self.scanning);
        let main = self.main.clone();
        let worker_track = track.clone();
        let worker_abort = abort.clone();
        let worker_slot = Arc::clone(&slot);

        let spawned = thread::Builder::new()
            .name("waveform-scan".to_string())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    scan_track(backend.as_ref(), &worker_track, &worker_abort)
                }));
                let outcome = match result {
                    Ok(result) => ScanOutcome::from(result),
                    Err(payload) => ScanOutcome::Failed(
                        ScanError::Worker(panic_message(payload.as_ref())).to_string(),
                    ),
                };
                match &outcome {
                    ScanOutcome::Completed(_) => {
                        log::debug!("Scan finished: {}", worker_track.location())
                    }
                    ScanOutcome::Cancelled => {
                        log::debug!("Scan cancelled: {}", worker_track.location())
                    }
                    ScanOutcome::Failed(e) => {
                        log::warn!("Scan failed for {}: {}", worker_track.location(), e)
                    }
                }
                scanning.store(false, Ordering::SeqCst);
                deliver(&main, &worker_slot, outcome);
            });

        match spawned {
            Ok(handle) => *active = Some(ActiveScan { abort, handle }),
            Err(e) => {
                log::error!("Failed to spawn scan worker: {}", e);
                self.scanning.store(false, Ordering::SeqCst);
                deliver(
                    &self.main,
                    &slot,
                    ScanOutcome::Failed(ScanError::Worker(e.to_string()).to_string()),
                );
            }
        }
    }

    /// Blocking scan on the calling thread. Does not touch the scanner state.
    pub fn scan_sync(
        &self,
        track: &TrackHandle,
        abort: &AbortSignal,
    ) -> Result<WaveformData, ScanError> {
        scan_track(self.backend.as_ref(), track, abort)
    }

    /// Signal the active scan, if any, to stop at its next chunk boundary.
    pub fn cancel(&self) {
        if let Some(active) = self.lock_active().as_ref() {
            active.abort.abort();
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveScan>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WaveformScanner {
    fn drop(&mut self) {
        if let Some(active) = self.lock_active().take() {
            active.abort.abort();
            if active.handle.join().is_err() {
                log::warn!("Scan worker terminated abnormally during shutdown");
            }
        }
    }
}

fn deliver(main: &MainThreadHandle, slot: &Mutex<Option<ScanCallback>>, outcome: ScanOutcome) {
    let callback = slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(callback) = callback {
        if !main.post(move || callback(outcome)) {
            log::debug!("Main queue gone; dropping scan callback");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Decode `track` end to end and reduce it to a `BUCKET_COUNT`-bucket envelope.
///
/// `abort` is checked before probing and at every chunk boundary.
pub fn scan_track(
    backend: &dyn AudioBackend,
    track: &TrackHandle,
    abort: &AbortSignal,
) -> Result<WaveformData, ScanError> {
    if !track.is_valid() {
        return Err(ScanError::InvalidTrack);
    }
    abort.check()?;

    let info = backend.probe(track)?;
    let duration = info
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or(ScanError::NoDuration)?;
    let channels = info
        .channels
        .filter(|&c| c > 0)
        .unwrap_or(DEFAULT_CHANNELS)
        .min(MAX_CHANNELS);
    let sample_rate = info
        .sample_rate
        .filter(|&r| r > 0)
        .unwrap_or(DEFAULT_SAMPLE_RATE);
    let per_bucket = peaks::samples_per_bucket(duration, sample_rate);

    log::debug!(
        "Scanning {}: {:.2}s, {} ch, {} Hz, {} samples/bucket",
        track.location(),
        duration,
        channels,
        sample_rate,
        per_bucket
    );

    let mut stream = backend.open(track, abort)?;
    let mut waveform = WaveformData::new(channels, sample_rate, duration);
    let mut acc = PeakAccumulator::new(channels, per_bucket);

    while let Some(chunk) = stream.next_chunk(abort)? {
        abort.check()?;
        acc.feed(&chunk, &mut waveform);
        if acc.is_full() {
            break;
        }
    }

    let filled = acc.finish(&mut waveform);
    if filled < BUCKET_COUNT {
        log::debug!(
            "{}: decode ended after {} of {} buckets",
            track.location(),
            filled,
            BUCKET_COUNT
        );
    }
    Ok(waveform)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic decoding backend for scanner and service tests.

    use super::*;
    use std::time::{Duration, Instant};

    /// Generates `frames` frames of a full-scale ramp from -1 to +1.
    /// Paths containing `blocking_marker` hang after their first chunk until
    /// aborted; paths containing "panic" panic when opened.
    pub struct FakeBackend {
        pub info: StreamInfo,
        pub frames: usize,
        pub stream_channels: u32,
        pub chunk_frames: usize,
        pub blocking_marker: Option<String>,
    }

    impl FakeBackend {
        pub fn ramp(channels: u32, sample_rate: u32, frames: usize) -> Self {
            Self {
                info: StreamInfo {
                    duration: Some(frames as f64 / sample_rate as f64),
                    channels: Some(channels),
                    sample_rate: Some(sample_rate),
                },
                frames,
                stream_channels: channels,
                chunk_frames: 500,
                blocking_marker: None,
            }
        }

        pub fn blocking_on(mut self, marker: &str) -> Self {
            self.blocking_marker = Some(marker.to_string());
            self
        }
    }

    impl AudioBackend for FakeBackend {
        fn probe(&self, _track: &TrackHandle) -> Result<StreamInfo, DecodeError> {
            Ok(self.info)
        }

        fn open(
            &self,
            track: &TrackHandle,
            _abort: &AbortSignal,
        ) -> Result<Box<dyn DecodeStream>, DecodeError> {
            let path = track.path().to_string_lossy();
            if path.contains("panic") {
                panic!("synthetic decoder crash");
            }
            let blocking = self
                .blocking_marker
                .as_deref()
                .is_some_and(|marker| path.contains(marker));
            Ok(Box::new(RampStream {
                total: self.frames,
                position: 0,
                channels: self.stream_channels,
                chunk_frames: self.chunk_frames,
                blocking,
            }))
        }
    }

    pub struct RampStream {
        total: usize,
        position: usize,
        channels: u32,
        chunk_frames: usize,
        blocking: bool,
    }

    pub fn ramp_value(frame: usize, total: usize) -> f32 {
        (-1.0 + 2.0 * frame as f64 / total as f64) as f32
    }

    impl DecodeStream for RampStream {
        fn next_chunk(&mut self, abort: &AbortSignal) -> Result<Option<AudioChunk>, DecodeError> {
            if self.blocking && self.position > 0 {
                let deadline = Instant::now() + Duration::from_secs(10);
                while Instant::now() < deadline {
                    if abort.is_aborted() {
                        return Err(DecodeError::Aborted);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                return Ok(None);
            }
            if self.position >= self.total {
                return Ok(None);
            }
            let end = (self.position + self.chunk_frames).min(self.total);
            let mut samples = Vec::with_capacity((end - self.position) * self.channels as usize);
            for frame in self.position..end {
                let v = ramp_value(frame, self.total);
                for _ in 0..self.channels {
                    samples.push(v);
                }
            }
            self.position = end;
            Ok(Some(AudioChunk {
                samples,
                channels: self.channels,
            }))
        }
    }
}
