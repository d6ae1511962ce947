//! Batch pre-scanning of music directories into the waveform cache.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::SUPPORTED_EXTENSIONS;
use crate::cache::WaveformCache;
use crate::scanner::{AbortSignal, ScanError, WaveformScanner};
use crate::track::TrackHandle;

#[derive(Error, Debug)]
pub enum WarmError {
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Waveform cache is not open")]
    CacheClosed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WarmResult {
    pub scanned: u64,
    pub cached: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Walk `paths` and collect every file with a supported audio extension.
pub fn collect_audio_files<P: AsRef<Path>>(paths: &[P]) -> Vec<PathBuf> {
    let mut audio_files = Vec::new();

    for path in paths {
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if is_supported(entry.path()) {
                audio_files.push(entry.into_path());
            }
        }
    }

    audio_files.sort();
    audio_files
}

pub fn is_supported(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

enum FileAction {
    Cached,
    Skipped,
    Failed,
}

/// Scan every uncached file in parallel and store the envelopes.
///
/// Files are handled in chunks of `jobs * 2`: a chunk is scanned on the rayon
/// pool, then its results are written before the next chunk starts, so memory
/// stays bounded and an interrupted run keeps everything stored so far.
///
/// Raising `abort` stops in-flight scans at their next chunk boundary and
/// skips every remaining chunk; files not scanned count as skipped.
pub fn warm_cache(
    cache: &WaveformCache,
    scanner: &WaveformScanner,
    files: &[PathBuf],
    jobs: usize,
    force: bool,
    abort: &AbortSignal,
) -> Result<WarmResult, WarmError> {
    if !cache.is_open() {
        return Err(WarmError::CacheClosed);
    }

    let mut result = WarmResult::default();
    if files.is_empty() {
        log::info!("No audio files to warm");
        return Ok(result);
    }

    let jobs = jobs.max(1);
    log::info!("Warming {} files with {} workers", files.len(), jobs);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;

    let mut done = 0;
    for chunk in files.chunks(jobs * 2) {
        if abort.is_aborted() {
            log::info!("Warm interrupted with {} files left", files.len() - done);
            result.skipped += (files.len() - done) as u64;
            break;
        }
        done += chunk.len();
        let scans: Vec<_> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|path| {
                    let track = TrackHandle::from_path(path);
                    let scan = if !force && cache.has_waveform(&track) {
                        None
                    } else {
                        Some(scanner.scan_sync(&track, abort))
                    };
                    pb.inc(1);
                    (track, scan)
                })
                .collect()
        });

        for (track, scan) in scans {
            let action = match scan {
                None => FileAction::Skipped,
                Some(Ok(data)) => {
                    result.scanned += 1;
                    if cache.store_waveform(&track, &data) {
                        FileAction::Cached
                    } else {
                        log::error!("Failed to store waveform for {}", track.path().display());
                        FileAction::Failed
                    }
                }
                Some(Err(ScanError::Cancelled)) => FileAction::Skipped,
                Some(Err(e)) => {
                    log::warn!("Scan failed for {}: {}", track.path().display(), e);
                    FileAction::Failed
                }
            };
            match action {
                FileAction::Cached => result.cached += 1,
                FileAction::Skipped => result.skipped += 1,
                FileAction::Failed => result.failed += 1,
            }
        }

        pb.set_message(format!("{} cached, {} failed", result.cached, result.failed));
    }

    pb.finish_with_message(format!(
        "Done: {} cached, {} skipped, {} failed",
        result.cached, result.skipped, result.failed
    ));

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MainQueue;
    use crate::scanner::testing::FakeBackend;
    use std::sync::Arc;

    #[test]
    fn test_collect_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("disc1");
        std::fs::create_dir_all(&nested).unwrap();
        for name in ["01.flac", "02.MP3", "cover.jpg", "notes.txt"] {
            std::fs::write(nested.join(name), b"x").unwrap();
        }
        std::fs::write(dir.path().join("03.ogg"), b"x").unwrap();

        let files = collect_audio_files(&[dir.path()]);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"01.flac".to_string()));
        assert!(names.contains(&"02.MP3".to_string()));
        assert!(names.contains(&"03.ogg".to_string()));
    }

    #[test]
    fn test_warm_skips_cached_files() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = ["a.flac", "b.flac", "c.flac"]
            .iter()
            .map(|name| {
                let path = dir.path().join(name);
                std::fs::write(&path, name.as_bytes()).unwrap();
                path
            })
            .collect();

        let queue = MainQueue::new();
        let scanner = WaveformScanner::new(Arc::new(FakeBackend::ramp(1, 8000, 4000)), queue.handle());
        let cache = WaveformCache::in_memory().unwrap();

        let first = warm_cache(&cache, &scanner, &files, 2, false, &AbortSignal::new()).unwrap();
        assert_eq!(first.cached, 3);
        assert_eq!(first.failed, 0);
        assert_eq!(cache.stats().entry_count, 3);

        let second = warm_cache(&cache, &scanner, &files, 2, false, &AbortSignal::new()).unwrap();
        assert_eq!(second.skipped, 3);
        assert_eq!(second.scanned, 0);

        let forced = warm_cache(&cache, &scanner, &files, 2, true, &AbortSignal::new()).unwrap();
        assert_eq!(forced.cached, 3);
    }

    #[test]
    fn test_warm_requires_open_cache() {
        let queue = MainQueue::new();
        let scanner = WaveformScanner::new(Arc::new(FakeBackend::ramp(1, 8000, 4000)), queue.handle());
        assert!(matches!(
            warm_cache(&WaveformCache::new(), &scanner, &[], 1, false, &AbortSignal::new()),
            Err(WarmError::CacheClosed)
        ));
    }

    #[test]
    fn test_aborted_warm_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..5)
            .map(|i| {
                let path = dir.path().join(format!("{i}.flac"));
                std::fs::write(&path, b"x").unwrap();
                path
            })
            .collect();

        let queue = MainQueue::new();
        let scanner = WaveformScanner::new(Arc::new(FakeBackend::ramp(1, 8000, 4000)), queue.handle());
        let cache = WaveformCache::in_memory().unwrap();
        let abort = AbortSignal::new();
        abort.abort();

        let result = warm_cache(&cache, &scanner, &files, 1, false, &abort).unwrap();
        assert_eq!(result.cached, 0);
        assert_eq!(result.failed, 0);
        assert_eq!(result.skipped, 5);
        assert_eq!(cache.stats().entry_count, 0);
    }
}
