pub mod cache;
pub mod config;
pub mod dispatch;
pub mod scanner;
pub mod service;
pub mod track;
pub mod warm;
pub mod waveform;

/// Audio file extensions we support
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // symphonia defaults
    "flac", "ogg", "oga", "wav", "mka",
    // symphonia optional codecs
    "mp3", "m4a", "mp4", "aac",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "seekwave";
