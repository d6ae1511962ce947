use serde::Serialize;

/// Aggregate numbers callers use to decide whether pruning is due.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    /// Age in days of the least-recently-accessed entry (0 when empty).
    pub oldest_access_days: f64,
}

/// A cache row's metadata, without the envelope blob.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub path: String,
    pub subsong: u32,
    pub channels: u32,
    pub sample_rate: u32,
    pub duration: f64,
    pub size_bytes: u64,
    /// Unix seconds
    pub created_at: i64,
    pub accessed_at: i64,
}
