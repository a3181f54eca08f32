use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::KbError;

/// A cooperative cancellation signal threaded through every public
/// operation (spec §5). Cheap to clone; all clones observe the same
/// underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(KbError::Cancelled)` if the token has been cancelled,
    /// otherwise `Ok(())`. Call at every suspension point (spec §5).
    pub fn check(&self) -> Result<(), KbError> {
        if self.is_cancelled() {
            Err(KbError::Cancelled)
        } else {
            Ok(())
        }
    }
}
