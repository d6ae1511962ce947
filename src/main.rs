use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use seekwave::cache::WaveformCache;
use seekwave::config::AppConfig;
use seekwave::dispatch::MainQueue;
use seekwave::scanner::{AbortSignal, SymphoniaBackend, WaveformScanner};
use seekwave::service::WaveformService;
use seekwave::track::TrackHandle;
use seekwave::waveform::WaveformData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "seekwave", version, about = "Waveform envelope scanner and cache")]
struct Cli {
    /// Path to the waveform cache database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a track's waveform, scanning it if it isn't cached
    Scan {
        /// Audio file
        file: PathBuf,

        /// Track index inside multi-track containers
        #[arg(long, default_value = "0")]
        subsong: u32,

        /// Give up after this many seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Pre-scan directories into the cache
    Warm {
        /// Directories to walk (defaults to config file music_dirs)
        paths: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Re-scan files that are already cached
        #[arg(long)]
        force: bool,
    },

    /// Print a text rendering of a track's waveform
    Show {
        /// Audio file
        file: PathBuf,

        /// Track index inside multi-track containers
        #[arg(long, default_value = "0")]
        subsong: u32,

        /// Output width in characters
        #[arg(short, long, default_value = "72")]
        width: usize,

        /// Give up after this many seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// List cached waveforms, most recently used first
    List {
        /// Number of results
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Show cache statistics
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Apply the configured retention window and size limit
    Prune,

    /// Delete every cached waveform
    Clear,
}

const SPARK_LEVELS: &[char] = &[' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli.db_path.clone().unwrap_or_else(|| config.resolve_db_path());
    log::info!("Cache database: {}", db_path.display());

    let queue = MainQueue::new();
    let cache = Arc::new(WaveformCache::new());
    cache
        .open(&db_path)
        .with_context(|| format!("Failed to open cache at {}", db_path.display()))?;
    let scanner = WaveformScanner::new(Arc::new(SymphoniaBackend::new()), queue.handle());
    let service = WaveformService::new(Arc::clone(&cache), scanner, config.cache);
    service.initialize(None);

    let outcome = run(cli.command, &config, &queue, &service);
    service.shutdown();
    outcome
}

fn run(command: Commands, config: &AppConfig, queue: &MainQueue, service: &WaveformService) -> Result<()> {
    match command {
        Commands::Scan { file, subsong, timeout } => {
            let track = track_for(&file, subsong)?;
            let data = fetch_waveform(queue, service, &track, timeout)?;
            println!("{}", track.location());
            println!(
                "  {} ch, {} Hz, {:.2}s, {} KiB in memory",
                data.channel_count,
                data.sample_rate,
                data.duration,
                data.memory_size() / 1024
            );
            for ch in 0..data.channel_count as usize {
                let peak = data.max[ch]
                    .iter()
                    .chain(data.min[ch].iter())
                    .fold(0.0f32, |acc, v| acc.max(v.abs()));
                println!("  ch{}: peak {:.3}", ch, peak);
            }
        }

        Commands::Warm { paths, jobs, force } => {
            // Resolve paths: CLI args > config music_dirs
            let warm_paths = if !paths.is_empty() {
                paths
            } else if !config.music_dirs.is_empty() {
                config.music_dirs.clone()
            } else {
                anyhow::bail!(
                    "No directories to warm. Pass paths as arguments or set music_dirs in config."
                );
            };

            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let files = seekwave::warm::collect_audio_files(&warm_paths);
            let scanner = WaveformScanner::new(Arc::new(SymphoniaBackend::new()), queue.handle());
            let result = seekwave::warm::warm_cache(
                service.cache(),
                &scanner,
                &files,
                workers,
                force,
                &AbortSignal::new(),
            )
            .context("Warm failed")?;
            println!(
                "Warm complete: {} cached, {} skipped, {} failed",
                result.cached, result.skipped, result.failed
            );
            service.prune_cache();
        }

        Commands::Show { file, subsong, width, timeout } => {
            let track = track_for(&file, subsong)?;
            let data = fetch_waveform(queue, service, &track, timeout)?;
            println!("{} ({:.1}s)", track.display_name(), data.duration);
            for ch in 0..data.channel_count {
                println!("{}", sparkline(&data, ch, width.max(2)));
            }
        }

        Commands::List { limit } => {
            let entries = service.cache().entries();
            if entries.is_empty() {
                println!("Cache is empty.");
                return Ok(());
            }
            println!(
                "{:<8} {:>3} {:>6} {:>9}  {}",
                "KiB", "ch", "kHz", "duration", "path"
            );
            println!("{}", "-".repeat(72));
            for e in entries.iter().take(limit) {
                let name = if e.subsong > 0 {
                    format!("{} #{}", e.path, e.subsong)
                } else {
                    e.path.clone()
                };
                println!(
                    "{:<8} {:>3} {:>6.1} {:>9}  {}",
                    e.size_bytes / 1024,
                    e.channels,
                    e.sample_rate as f64 / 1000.0,
                    format_duration(e.duration),
                    name
                );
            }
            if entries.len() > limit {
                println!("... and {} more", entries.len() - limit);
            }
        }

        Commands::Stats { json } => {
            let stats = service.cache_stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let settings = service.settings();
                println!("Entries:       {}", stats.entry_count);
                println!(
                    "Total size:    {:.1} MiB (limit {} MiB)",
                    stats.total_size_bytes as f64 / (1024.0 * 1024.0),
                    settings.max_size_mb
                );
                println!(
                    "Oldest access: {:.1} days (retention {} days)",
                    stats.oldest_access_days, settings.retention_days
                );
            }
        }

        Commands::Prune => {
            let report = service.prune_cache();
            println!(
                "Pruned {} expired and {} over-budget entries",
                report.expired, report.evicted
            );
        }

        Commands::Clear => {
            if !service.clear_cache() {
                anyhow::bail!("Failed to clear the waveform cache");
            }
            println!("Cache cleared.");
        }
    }

    Ok(())
}

fn track_for(file: &Path, subsong: u32) -> Result<TrackHandle> {
    let path = std::fs::canonicalize(file)
        .with_context(|| format!("Cannot resolve {}", file.display()))?;
    let stats = TrackHandle::from_path(&path).stats();
    Ok(TrackHandle::new(path, subsong, stats))
}

/// Request through the service and pump the main queue until the callback fires.
fn fetch_waveform(
    queue: &MainQueue,
    service: &WaveformService,
    track: &TrackHandle,
    timeout: u64,
) -> Result<WaveformData> {
    let slot: Arc<Mutex<Option<WaveformData>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    service.request_waveform(track, move |_, data| {
        if let Ok(mut guard) = sink.lock() {
            *guard = Some(data.clone());
        }
    });

    let delivered = queue.run_until(Duration::from_secs(timeout), || {
        slot.lock().map(|g| g.is_some()).unwrap_or(true)
    });
    if !delivered {
        service.cancel_request(track);
        anyhow::bail!("Timed out waiting for {}", track.location());
    }

    let data = slot
        .lock()
        .map_err(|_| anyhow::anyhow!("waveform result lock poisoned"))?
        .take()
        .unwrap_or_default();
    if !data.is_valid() {
        anyhow::bail!("No waveform available for {}", track.location());
    }
    Ok(data)
}

fn sparkline(data: &WaveformData, channel: u32, width: usize) -> String {
    (0..width)
        .map(|col| {
            let pos = col as f64 / (width - 1) as f64;
            let peak = data
                .max_at(channel, pos)
                .max(-data.min_at(channel, pos))
                .clamp(0.0, 1.0);
            let level = (peak * (SPARK_LEVELS.len() - 1) as f32).round() as usize;
            SPARK_LEVELS[level.min(SPARK_LEVELS.len() - 1)]
        })
        .collect()
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}
