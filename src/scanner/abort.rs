use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ScanError;

/// Cooperative cancellation flag shared between a caller and a running scan.
///
/// Clones observe the same flag. Decoders poll it at chunk boundaries; nothing
/// is ever interrupted forcibly.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// `Err(ScanError::Cancelled)` once aborted.
    pub fn check(&self) -> Result<(), ScanError> {
        if self.is_aborted() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}
