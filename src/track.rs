use std::fmt;
use std::path::{Path, PathBuf};

/// Size and modification time of a track's file, used for cache identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStats {
    pub size: u64,
    /// Modification time in unix seconds.
    pub modified: i64,
}

impl FileStats {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            size: meta.len(),
            modified: format_mtime(meta),
        }
    }
}

/// Where a track lives: the stable identity used to decide whether a scan
/// result still belongs to the track the caller is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackLocation {
    pub path: PathBuf,
    pub subsong: u32,
}

impl fmt::Display for TrackLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subsong == 0 {
            write!(f, "{}", self.path.display())
        } else {
            write!(f, "{} #{}", self.path.display(), self.subsong)
        }
    }
}

/// A playable track as seen by the waveform subsystem.
///
/// `subsong` selects one track inside multi-track containers (cue sheets,
/// chiptune files); plain files use 0. `stats` is `None` when the file could
/// not be stat'ed, which still yields a usable (if less precise) cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    path: PathBuf,
    subsong: u32,
    stats: Option<FileStats>,
}

impl TrackHandle {
    pub fn new(path: impl Into<PathBuf>, subsong: u32, stats: Option<FileStats>) -> Self {
        Self {
            path: path.into(),
            subsong,
            stats,
        }
    }

    /// Build a handle for a plain file, reading its stats from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let stats = match std::fs::metadata(path) {
            Ok(meta) => Some(FileStats::from_metadata(&meta)),
            Err(e) => {
                log::debug!("Could not stat {}: {}", path.display(), e);
                None
            }
        };
        Self::new(path, 0, stats)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subsong(&self) -> u32 {
        self.subsong
    }

    pub fn stats(&self) -> Option<FileStats> {
        self.stats
    }

    pub fn is_valid(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }

    pub fn location(&self) -> TrackLocation {
        TrackLocation {
            path: self.path.clone(),
            subsong: self.subsong,
        }
    }

    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

fn format_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path_reads_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.flac");
        std::fs::write(&path, b"not really flac").unwrap();

        let track = TrackHandle::from_path(&path);
        assert!(track.is_valid());
        let stats = track.stats().unwrap();
        assert_eq!(stats.size, 15);
        assert!(stats.modified > 0);
    }

    #[test]
    fn test_missing_file_has_no_stats() {
        let track = TrackHandle::from_path("/nonexistent/seekwave/missing.mp3");
        assert!(track.is_valid());
        assert!(track.stats().is_none());
    }

    #[test]
    fn test_empty_path_is_invalid() {
        assert!(!TrackHandle::new("", 0, None).is_valid());
    }

    #[test]
    fn test_location_ignores_stats() {
        let a = TrackHandle::new("/music/a.mp3", 1, Some(FileStats { size: 1, modified: 1 }));
        let b = TrackHandle::new("/music/a.mp3", 1, Some(FileStats { size: 2, modified: 9 }));
        let c = TrackHandle::new("/music/a.mp3", 2, None);
        assert_eq!(a.location(), b.location());
        assert_ne!(a.location(), c.location());
        assert_eq!(c.location().to_string(), "/music/a.mp3 #2");
    }

    #[test]
    fn test_display_name() {
        assert_eq!(TrackHandle::new("/music/x/01 Intro.ogg", 0, None).display_name(), "01 Intro.ogg");
    }
}
