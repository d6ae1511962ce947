use super::models::{CacheEntry, CacheStats};
use super::{Result, WaveformCache, cache_key};
use crate::track::TrackHandle;
use crate::waveform::WaveformData;
use rusqlite::{Connection, OptionalExtension, params};

/// Rows deleted per round while enforcing the size limit.
const EVICTION_BATCH: i64 = 10;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn touch(conn: &Connection, key: &str, at: i64) -> Result<()> {
    conn.execute(
        "UPDATE waveforms SET accessed_at = ?1 WHERE cache_key = ?2",
        params![at, key],
    )?;
    Ok(())
}

fn total_size(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM waveforms",
        [],
        |row| row.get(0),
    )?)
}

impl WaveformCache {
    /// True if an entry exists for the track's current identity. A hit counts as an access.
    pub fn has_waveform(&self, track: &TrackHandle) -> bool {
        let Some(key) = cache_key(track) else {
            return false;
        };
        self.with_conn("lookup", |conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM waveforms WHERE cache_key = ?1 LIMIT 1",
                    params![key],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                touch(conn, &key, now())?;
            }
            Ok(exists)
        })
        .unwrap_or(false)
    }

    /// Load and decode the cached envelope.
    ///
    /// A row whose blob no longer decodes is reported as a miss and left in
    /// place; pruning or clearing removes it eventually.
    pub fn get_waveform(&self, track: &TrackHandle) -> Option<WaveformData> {
        let key = cache_key(track)?;
        self.with_conn("read", |conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM waveforms WHERE cache_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(blob) = blob else {
                return Ok(None);
            };

            match WaveformData::decompress(&blob) {
                Some(data) => {
                    touch(conn, &key, now())?;
                    Ok(Some(data))
                }
                None => {
                    log::warn!(
                        "Ignoring undecodable cache entry for {} ({} bytes)",
                        track.location(),
                        blob.len()
                    );
                    Ok(None)
                }
            }
        })
        .flatten()
    }

    /// Compress and upsert the envelope. Returns false if nothing was written.
    pub fn store_waveform(&self, track: &TrackHandle, waveform: &WaveformData) -> bool {
        let Some(key) = cache_key(track) else {
            return false;
        };
        self.with_conn("store", |conn| {
            let blob = waveform.compress()?;
            let at = now();
            conn.execute(
                "INSERT OR REPLACE INTO waveforms
                    (cache_key, path, subsong, channels, sample_rate, duration,
                     data, size_bytes, created_at, accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    key,
                    track.path().to_string_lossy(),
                    track.subsong(),
                    waveform.channel_count,
                    waveform.sample_rate,
                    waveform.duration,
                    blob,
                    blob.len() as i64,
                    at,
                    at,
                ],
            )?;
            log::debug!(
                "Cached waveform for {} ({} bytes, key {}...)",
                track.location(),
                blob.len(),
                &key[..12]
            );
            Ok(())
        })
        .is_some()
    }

    pub fn remove_waveform(&self, track: &TrackHandle) -> bool {
        let Some(key) = cache_key(track) else {
            return false;
        };
        self.with_conn("remove", |conn| {
            conn.execute("DELETE FROM waveforms WHERE cache_key = ?1", params![key])?;
            Ok(())
        })
        .is_some()
    }

    /// Delete every entry and compact the database file.
    pub fn clear_cache(&self) -> bool {
        self.with_conn("clear", |conn| {
            let removed = conn.execute("DELETE FROM waveforms", [])?;
            if let Err(e) = conn.execute_batch("VACUUM") {
                log::warn!("VACUUM after clearing waveform cache failed: {}", e);
            }
            log::info!("Cleared waveform cache ({} entries)", removed);
            Ok(())
        })
        .is_some()
    }

    /// Delete entries not accessed within `max_age_days`. Returns the number removed.
    pub fn prune_old_entries(&self, max_age_days: i64) -> usize {
        if max_age_days <= 0 {
            return 0;
        }
        let cutoff = now() - max_age_days.saturating_mul(SECONDS_PER_DAY);
        self.with_conn("prune", |conn| {
            let removed = conn.execute(
                "DELETE FROM waveforms WHERE accessed_at < ?1",
                params![cutoff],
            )?;
            if removed > 0 {
                log::info!("Pruned {} waveform(s) older than {} days", removed, max_age_days);
            }
            Ok(removed)
        })
        .unwrap_or(0)
    }

    /// Evict least-recently-accessed entries until the total blob size fits in
    /// `max_size_mb` megabytes. Returns the number removed; 0 disables the limit.
    pub fn enforce_size_limit(&self, max_size_mb: u64) -> usize {
        if max_size_mb == 0 {
            return 0;
        }
        let max_bytes = i64::try_from(max_size_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX);
        self.enforce_size_limit_bytes(max_bytes)
    }

    /// Batch-and-recheck eviction: small deletes keep each statement short on
    /// very large caches.
    pub(crate) fn enforce_size_limit_bytes(&self, max_bytes: i64) -> usize {
        self.with_conn("evict", |conn| {
            let mut current = total_size(conn)?;
            let mut removed = 0usize;
            while current > max_bytes {
                let deleted = conn.execute(
                    "DELETE FROM waveforms WHERE cache_key IN (
                        SELECT cache_key FROM waveforms ORDER BY accessed_at ASC LIMIT ?1
                    )",
                    params![EVICTION_BATCH],
                )?;
                if deleted == 0 {
                    break;
                }
                removed += deleted;
                current = total_size(conn)?;
            }
            if removed > 0 {
                log::info!(
                    "Evicted {} waveform(s) to fit {} bytes (now {})",
                    removed,
                    max_bytes,
                    current
                );
            }
            Ok(removed)
        })
        .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        self.with_conn("stats", |conn| {
            let (count, total): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM waveforms",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let oldest: Option<i64> =
                conn.query_row("SELECT MIN(accessed_at) FROM waveforms", [], |row| row.get(0))?;

            let oldest_access_days = oldest
                .map(|at| (now() - at).max(0) as f64 / SECONDS_PER_DAY as f64)
                .unwrap_or(0.0);
            Ok(CacheStats {
                entry_count: count as usize,
                total_size_bytes: total as u64,
                oldest_access_days,
            })
        })
        .unwrap_or_default()
    }

    /// All entries, most recently accessed first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.with_conn("list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT cache_key, path, subsong, channels, sample_rate, duration,
                        size_bytes, created_at, accessed_at
                 FROM waveforms ORDER BY accessed_at DESC, cache_key",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(CacheEntry {
                        cache_key: row.get(0)?,
                        path: row.get(1)?,
                        subsong: row.get(2)?,
                        channels: row.get(3)?,
                        sample_rate: row.get(4)?,
                        duration: row.get(5)?,
                        size_bytes: row.get::<_, i64>(6)? as u64,
                        created_at: row.get(7)?,
                        accessed_at: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::track::FileStats;
    use crate::waveform::{BUCKET_COUNT, CodecError};

    fn track(path: &str, modified: i64) -> TrackHandle {
        TrackHandle::new(path, 0, Some(FileStats { size: 4096, modified }))
    }

    fn envelope(level: f32) -> WaveformData {
        let mut wf = WaveformData::new(2, 44100, 240.0);
        for ch in 0..2 {
            for i in 0..BUCKET_COUNT {
                let v = level * ((i % 64) as f32 / 64.0);
                wf.min[ch][i] = -v;
                wf.max[ch][i] = v;
                wf.rms[ch][i] = v * 0.7;
            }
        }
        wf
    }

    /// Backdate an entry's access time.
    fn set_accessed_at(cache: &WaveformCache, track: &TrackHandle, at: i64) {
        let key = cache_key(track).unwrap();
        cache
            .with_conn("backdate", |conn| touch(conn, &key, at))
            .unwrap();
    }

    fn accessed_at(cache: &WaveformCache, track: &TrackHandle) -> i64 {
        let key = cache_key(track).unwrap();
        cache
            .with_conn("read access", |conn| {
                Ok(conn.query_row(
                    "SELECT accessed_at FROM waveforms WHERE cache_key = ?1",
                    params![key],
                    |row| row.get(0),
                )?)
            })
            .unwrap()
    }

    /// Insert a row with a fixed blob size, bypassing compression.
    fn insert_raw(cache: &WaveformCache, key: &str, size_bytes: i64, accessed: i64) {
        cache
            .with_conn("insert raw", |conn| {
                conn.execute(
                    "INSERT INTO waveforms
                        (cache_key, path, subsong, channels, sample_rate, duration,
                         data, size_bytes, created_at, accessed_at)
                     VALUES (?1, ?1, 0, 2, 44100, 1.0, x'00', ?2, ?3, ?3)",
                    params![key, size_bytes, accessed],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn keys(cache: &WaveformCache) -> Vec<String> {
        let mut keys: Vec<String> = cache.entries().into_iter().map(|e| e.cache_key).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_store_and_get_roundtrip() {
        let cache = WaveformCache::in_memory().unwrap();
        let t = track("/music/a.flac", 1_700_000_000);
        let wf = envelope(0.9);

        assert!(!cache.has_waveform(&t));
        assert!(cache.get_waveform(&t).is_none());

        assert!(cache.store_waveform(&t, &wf));
        assert!(cache.has_waveform(&t));
        assert_eq!(cache.get_waveform(&t).unwrap(), wf);

        let entries = cache.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/music/a.flac");
        assert_eq!(entries[0].channels, 2);
        assert_eq!(entries[0].sample_rate, 44100);
        assert!(entries[0].size_bytes > 0);
    }

    #[test]
    fn test_store_replaces_existing_entry() {
        let cache = WaveformCache::in_memory().unwrap();
        let t = track("/music/a.flac", 1_700_000_000);
        assert!(cache.store_waveform(&t, &envelope(0.2)));
        assert!(cache.store_waveform(&t, &envelope(0.8)));

        assert_eq!(cache.stats().entry_count, 1);
        assert_eq!(cache.get_waveform(&t).unwrap(), envelope(0.8));
    }

    #[test]
    fn test_modified_file_misses() {
        let cache = WaveformCache::in_memory().unwrap();
        let before = track("/music/a.flac", 1_700_000_000);
        let after = track("/music/a.flac", 1_700_000_060);

        assert!(cache.store_waveform(&before, &envelope(0.5)));
        assert_ne!(cache_key(&before), cache_key(&after));
        assert!(cache.get_waveform(&after).is_none());
        assert!(cache.get_waveform(&before).is_some());
    }

    #[test]
    fn test_invalid_inputs_are_not_stored() {
        let cache = WaveformCache::in_memory().unwrap();
        assert!(!cache.store_waveform(&track("/music/a.flac", 1), &WaveformData::default()));
        assert!(!cache.store_waveform(&TrackHandle::new("", 0, None), &envelope(0.5)));
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[test]
    fn test_encoding_failure_surfaces_as_codec_error() {
        let cache = WaveformCache::in_memory().unwrap();
        let stored = cache.with_conn("encode", |_| {
            WaveformData::default().compress()?;
            Ok(())
        });
        assert!(stored.is_none());

        let e = CacheError::from(WaveformData::default().compress().unwrap_err());
        assert!(matches!(e, CacheError::Codec(CodecError::InvalidEnvelope)));
        assert!(e.to_string().starts_with("Waveform encoding failed"));
    }

    #[test]
    fn test_hit_refreshes_access_time() {
        let cache = WaveformCache::in_memory().unwrap();
        let t = track("/music/a.flac", 1_700_000_000);
        cache.store_waveform(&t, &envelope(0.5));
        set_accessed_at(&cache, &t, 1000);

        assert!(cache.get_waveform(&t).is_some());
        assert!(accessed_at(&cache, &t) > 1000);

        set_accessed_at(&cache, &t, 1000);
        assert!(cache.has_waveform(&t));
        assert!(accessed_at(&cache, &t) > 1000);
    }

    #[test]
    fn test_corrupt_blob_is_a_miss_and_kept() {
        let cache = WaveformCache::in_memory().unwrap();
        let t = track("/music/a.flac", 1_700_000_000);
        cache.store_waveform(&t, &envelope(0.5));
        set_accessed_at(&cache, &t, 1000);

        let key = cache_key(&t).unwrap();
        cache
            .with_conn("corrupt", |conn| {
                conn.execute(
                    "UPDATE waveforms SET data = x'ffffffff0000' WHERE cache_key = ?1",
                    params![key],
                )?;
                Ok(())
            })
            .unwrap();

        assert!(cache.get_waveform(&t).is_none());
        assert_eq!(cache.stats().entry_count, 1);
        assert_eq!(accessed_at(&cache, &t), 1000);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = WaveformCache::in_memory().unwrap();
        let a = track("/music/a.flac", 1);
        let b = track("/music/b.flac", 1);
        cache.store_waveform(&a, &envelope(0.5));
        cache.store_waveform(&b, &envelope(0.5));

        assert!(cache.remove_waveform(&a));
        assert!(cache.get_waveform(&a).is_none());
        assert_eq!(cache.stats().entry_count, 1);

        assert!(cache.clear_cache());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_prune_old_entries() {
        let cache = WaveformCache::in_memory().unwrap();
        let old = track("/music/old.flac", 1);
        let fresh = track("/music/fresh.flac", 1);
        cache.store_waveform(&old, &envelope(0.5));
        cache.store_waveform(&fresh, &envelope(0.5));
        set_accessed_at(&cache, &old, now() - 40 * SECONDS_PER_DAY);

        assert_eq!(cache.prune_old_entries(0), 0);
        assert_eq!(cache.prune_old_entries(-5), 0);
        assert_eq!(cache.prune_old_entries(30), 1);
        assert!(cache.get_waveform(&old).is_none());
        assert!(cache.get_waveform(&fresh).is_some());
    }

    #[test]
    fn test_enforce_size_limit_evicts_oldest_first() {
        let cache = WaveformCache::in_memory().unwrap();
        for i in 0..25 {
            insert_raw(&cache, &format!("k{:02}", i), 100, 1000 + i);
        }
        assert_eq!(cache.stats().total_size_bytes, 2500);

        // 1200 bytes allows 12 rows: first batch leaves 15, second leaves 5
        let removed = cache.enforce_size_limit_bytes(1200);
        assert_eq!(removed, 20);
        let expected: Vec<String> = (20..25).map(|i| format!("k{:02}", i)).collect();
        assert_eq!(keys(&cache), expected);
    }

    #[test]
    fn test_enforce_size_limit_stops_when_under_budget() {
        let cache = WaveformCache::in_memory().unwrap();
        for i in 0..12 {
            insert_raw(&cache, &format!("k{:02}", i), 100, 1000 + i);
        }
        assert_eq!(cache.enforce_size_limit_bytes(1200), 0);
        assert_eq!(cache.enforce_size_limit_bytes(1150), 10);
        assert_eq!(keys(&cache), vec!["k10".to_string(), "k11".to_string()]);
        assert_eq!(cache.enforce_size_limit(0), 0);
        assert_eq!(cache.enforce_size_limit(1), 0);
    }

    #[test]
    fn test_stats_reports_oldest_access() {
        let cache = WaveformCache::in_memory().unwrap();
        assert_eq!(cache.stats().oldest_access_days, 0.0);

        insert_raw(&cache, "a", 10, now() - 3 * SECONDS_PER_DAY);
        insert_raw(&cache, "b", 32, now());
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.total_size_bytes, 42);
        assert!((stats.oldest_access_days - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_unopened_cache_degrades_to_miss() {
        let cache = WaveformCache::new();
        let t = track("/music/a.flac", 1);
        assert!(!cache.store_waveform(&t, &envelope(0.5)));
        assert!(cache.get_waveform(&t).is_none());
        assert!(!cache.has_waveform(&t));
        assert!(!cache.clear_cache());
        assert_eq!(cache.prune_old_entries(30), 0);
        assert_eq!(cache.enforce_size_limit(1), 0);
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("waveforms.db");
        let audio = dir.path().join("song.wav");
        std::fs::write(&audio, b"RIFF").unwrap();
        let t = TrackHandle::from_path(&audio);

        let cache = WaveformCache::new();
        cache.open(&db_path).unwrap();
        assert!(cache.store_waveform(&t, &envelope(0.4)));
        cache.close();

        let reopened = WaveformCache::new();
        reopened.open(&db_path).unwrap();
        assert_eq!(reopened.get_waveform(&t).unwrap(), envelope(0.4));
    }
}
