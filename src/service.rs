//! Cache-first waveform requests with staleness protection.
//!
//! The service is the single entry point a UI talks to. A request is served
//! from the cache when possible; otherwise a background scan is started and
//! its result is delivered on the main queue, unless a newer request (or an
//! explicit cancel) has superseded it by then.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::WaveformCache;
use crate::cache::models::CacheStats;
use crate::config::CacheConfig;
use crate::scanner::{ScanOutcome, WaveformScanner};
use crate::track::{TrackHandle, TrackLocation};
use crate::waveform::WaveformData;

/// Broadcast receiver. `None` means the request ended without data.
pub type WaveformListener = Arc<dyn Fn(&TrackHandle, Option<&WaveformData>) + Send + Sync + 'static>;

/// Rows removed by one `prune_cache` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Older than the retention window.
    pub expired: usize,
    /// Evicted to get under the size limit.
    pub evicted: usize,
}

/// The one request whose result may still be surfaced.
///
/// `seq` disambiguates back-to-back requests for the same location, so a
/// re-requested track never accepts the result of the earlier scan.
#[derive(Debug, Clone, PartialEq)]
struct PendingRequest {
    location: TrackLocation,
    seq: u64,
}

/// State completion callbacks need after the request call has returned.
struct Shared {
    cache: Arc<WaveformCache>,
    pending: Mutex<Option<PendingRequest>>,
    listeners: Mutex<Vec<WaveformListener>>,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<WaveformListener>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Listeners run on a snapshot taken with the lock released, so they may
    /// call back into the service.
    fn notify(&self, track: &TrackHandle, data: Option<&WaveformData>) {
        let listeners: Vec<WaveformListener> = self.lock_listeners().iter().cloned().collect();
        for listener in listeners {
            listener(track, data);
        }
    }

    /// Runs on the main queue once the scan for `track` (request `seq`) ends.
    fn complete<F>(&self, track: &TrackHandle, seq: u64, outcome: ScanOutcome, callback: F)
    where
        F: FnOnce(&TrackHandle, &WaveformData),
    {
        {
            let mut pending = self.lock_pending();
            let current = PendingRequest {
                location: track.location(),
                seq,
            };
            if pending.as_ref() != Some(&current) {
                log::debug!("Discarding stale waveform result for {}", track.location());
                return;
            }
            *pending = None;
        }

        if outcome.is_cancelled() {
            log::debug!("Waveform scan cancelled for {}", track.location());
        } else if let ScanOutcome::Failed(e) = &outcome {
            log::warn!("Waveform scan failed for {}: {}", track.location(), e);
        }

        match outcome.into_waveform() {
            Some(data) => {
                if !self.cache.store_waveform(track, &data) {
                    log::debug!("Waveform for {} not cached", track.location());
                }
                callback(track, &data);
                self.notify(track, Some(&data));
            }
            None => {
                callback(track, &WaveformData::default());
                self.notify(track, None);
            }
        }
    }
}

/// Coordinates the cache and the scanner for a UI.
///
/// Callbacks and listeners run on the thread draining the scanner's
/// [`MainQueue`](crate::dispatch::MainQueue), or synchronously inside
/// `request_waveform` for cache hits and invalid tracks. A listener may call
/// back into the service; listeners added or removed during a broadcast take
/// effect from the next one.
pub struct WaveformService {
    shared: Arc<Shared>,
    scanner: WaveformScanner,
    settings: CacheConfig,
    next_seq: AtomicU64,
    initialized: AtomicBool,
}

impl WaveformService {
    pub fn new(cache: Arc<WaveformCache>, scanner: WaveformScanner, settings: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                pending: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
            }),
            scanner,
            settings,
            next_seq: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Open the cache at `db_path` (if given) and prune it. Idempotent.
    ///
    /// A cache that fails to open is logged and left closed; requests then
    /// always scan.
    pub fn initialize(&self, db_path: Option<&Path>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = db_path {
            if let Err(e) = self.shared.cache.open(path) {
                log::error!(
                    "Failed to open waveform cache at {}: {}. Continuing uncached.",
                    path.display(),
                    e
                );
            }
        }
        let report = self.prune_cache();
        log::info!(
            "Waveform service ready ({} expired, {} evicted)",
            report.expired,
            report.evicted
        );
    }

    /// Cancel outstanding work and close the cache. Idempotent.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_all_requests();
        self.shared.cache.close();
        log::info!("Waveform service shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Ask for `track`'s envelope.
    ///
    /// * invalid track: `callback` gets an empty envelope right away
    /// * cache hit: `callback` and listeners run before this returns
    /// * miss: a scan starts and supersedes any earlier pending request;
    ///   `callback` runs later on the main queue, or never if superseded
    pub fn request_waveform(
        &self,
        track: &TrackHandle,
        callback: impl FnOnce(&TrackHandle, &WaveformData) + Send + 'static,
    ) {
        if !track.is_valid() {
            callback(track, &WaveformData::default());
            return;
        }

        if let Some(data) = self.shared.cache.get_waveform(track) {
            log::debug!("Waveform cache hit: {}", track.location());
            self.supersede_pending();
            callback(track, &data);
            self.shared.notify(track, Some(&data));
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.lock_pending() = Some(PendingRequest {
            location: track.location(),
            seq,
        });
        log::debug!("Waveform cache miss, scanning {}", track.location());

        let shared = Arc::clone(&self.shared);
        let requested = track.clone();
        self.scanner.scan_async(track, move |outcome| {
            shared.complete(&requested, seq, outcome, callback);
        });
    }

    /// Stop the scan for `track` if it is the pending request.
    pub fn cancel_request(&self, track: &TrackHandle) {
        let mut pending = self.shared.lock_pending();
        if pending.as_ref().is_some_and(|p| p.location == track.location()) {
            self.scanner.cancel();
            *pending = None;
        }
    }

    pub fn cancel_all_requests(&self) {
        let mut pending = self.shared.lock_pending();
        self.scanner.cancel();
        *pending = None;
    }

    /// Cache lookup only; never scans.
    pub fn get_cached_waveform(&self, track: &TrackHandle) -> Option<WaveformData> {
        self.shared.cache.get_waveform(track)
    }

    /// Register a broadcast receiver. Listeners run in registration order.
    pub fn add_listener(
        &self,
        listener: impl Fn(&TrackHandle, Option<&WaveformData>) + Send + Sync + 'static,
    ) {
        self.shared.lock_listeners().push(Arc::new(listener));
    }

    pub fn remove_all_listeners(&self) {
        self.shared.lock_listeners().clear();
    }

    /// Apply the configured retention window and size limit.
    pub fn prune_cache(&self) -> PruneReport {
        let report = PruneReport {
            expired: self
                .shared
                .cache
                .prune_old_entries(self.settings.retention_days),
            evicted: self
                .shared
                .cache
                .enforce_size_limit(self.settings.max_size_mb),
        };
        if report.expired > 0 || report.evicted > 0 {
            log::info!(
                "Pruned waveform cache: {} expired, {} evicted",
                report.expired,
                report.evicted
            );
        }
        report
    }

    pub fn clear_cache(&self) -> bool {
        self.shared.cache.clear_cache()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn cache(&self) -> &Arc<WaveformCache> {
        &self.shared.cache
    }

    pub fn settings(&self) -> CacheConfig {
        self.settings
    }

    /// Location of the request whose result is still awaited, if any.
    pub fn pending_track(&self) -> Option<TrackLocation> {
        self.shared
            .lock_pending()
            .as_ref()
            .map(|p| p.location.clone())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    fn supersede_pending(&self) {
        let mut pending = self.shared.lock_pending();
        if let Some(previous) = pending.take() {
            log::debug!("Request for {} superseded", previous.location);
            self.scanner.cancel();
        }
    }
}
