use sha2::{Digest, Sha256};

use crate::track::TrackHandle;

/// Content-identity key for a track: SHA-256 over `path|subsong|size|mtime`.
///
/// Any change to the file's size or modification time produces a new key, so
/// stale rows are simply never looked up again and age out through pruning.
/// Returns a 64-character lowercase hex string, or `None` for an invalid track.
pub fn cache_key(track: &TrackHandle) -> Option<String> {
    if !track.is_valid() {
        return None;
    }
    let stats = track.stats().unwrap_or_default();
    let input = format!(
        "{}|{}|{}|{}",
        track.path().to_string_lossy(),
        track.subsong(),
        stats.size,
        stats.modified
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}
