use lofty::prelude::*;
use std::path::Path;

use super::source::StreamInfo;

/// Read stream properties from the file's container metadata.
/// Returns an all-`None` info on failure (unknown formats, unreadable files).
pub fn read_stream_info(path: &Path) -> StreamInfo {
    let tagged_file = match lofty::read_from_path(path) {
        Ok(f) => f,
        Err(e) => {
            log::debug!("Could not read properties from {}: {}", path.display(), e);
            return StreamInfo::default();
        }
    };

    let props = tagged_file.properties();
    let duration = {
        let secs = props.duration().as_secs_f64();
        if secs > 0.0 { Some(secs) } else { None }
    };

    StreamInfo {
        duration,
        channels: props.channels().map(u32::from).filter(|&c| c > 0),
        sample_rate: props.sample_rate().filter(|&r| r > 0),
    }
}
