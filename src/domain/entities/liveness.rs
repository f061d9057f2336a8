//! Cooperative cancellation flag shared by one execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::errors::{ImageError, ImageResult};

/// Liveness of a single fetch/decode execution.
///
/// Long-running loops (body reads, disk copies) call [`Liveness::check`]
/// between chunks so that an execution nobody waits for stops promptly.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    cancelled: Arc<AtomicBool>,
}

impl Liveness {
    /// Creates a live flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the execution as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails with [`ImageError::Cancelled`] once cancelled.
    ///
    /// # Errors
    /// Returns `Cancelled` if the flag has been set.
    pub fn check(&self) -> ImageResult<()> {
        if self.is_cancelled() {
            Err(ImageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Cancels a [`Liveness`] when dropped unless disarmed first.
#[derive(Debug)]
pub struct CancelOnDrop {
    liveness: Liveness,
    armed: bool,
}

impl CancelOnDrop {
    /// Arms a guard for `liveness`.
    #[must_use]
    pub const fn new(liveness: Liveness) -> Self {
        Self {
            liveness,
            armed: true,
        }
    }

    /// Prevents cancellation on drop.
    pub const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.liveness.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_cancels_when_dropped_armed() {
        let liveness = Liveness::new();
        drop(CancelOnDrop::new(liveness.clone()));
        assert!(liveness.is_cancelled());
        assert!(liveness.check().is_err());
    }

    #[test]
    fn test_disarmed_guard_keeps_liveness() {
        let liveness = Liveness::new();
        let mut guard = CancelOnDrop::new(liveness.clone());
        guard.disarm();
        drop(guard);
        assert!(!liveness.is_cancelled());
        assert!(liveness.check().is_ok());
    }
}
