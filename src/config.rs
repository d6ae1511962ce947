use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Directories to warm when `warm` has no CLI args.
    pub music_dirs: Vec<PathBuf>,
    /// Custom cache database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers for `warm`. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Waveform cache retention tunables.
    pub cache: CacheConfig,
}

/// Limits applied whenever the cache is pruned.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries not accessed for this many days are dropped. 0 disables.
    pub retention_days: i64,
    /// Upper bound on stored blob bytes, in MiB. 0 disables.
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_days: 180,
            max_size_mb: 2048,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/seekwave/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// The cache database to use: explicit setting, else the XDG default.
    pub fn resolve_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(default_db_path)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Default cache database location under the XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        dirs.data_dir().join("waveform_cache").join("waveforms.db")
    } else {
        // No home directory: fall back to the system temp dir
        std::env::temp_dir()
            .join(format!("{}_waveform_cache", crate::APP_NAME))
            .join("waveforms.db")
    }
}
