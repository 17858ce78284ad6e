//! Process-wide laser enable interlock.
//!
//! The laser is shared by every measurement in the process. A run acquires the
//! flag when its instruments are armed and releases it in every teardown branch.

use crate::error::{OdmrError, OdmrResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared laser enable flag. Clones refer to the same flag.
#[derive(Debug, Clone, Default)]
pub struct LaserEnable {
    enabled: Arc<AtomicBool>,
}

impl LaserEnable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the laser for a run.
    ///
    /// Fails with `HardwareUnavailable` if another run already holds it.
    pub fn acquire(&self) -> OdmrResult<()> {
        self.enabled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| OdmrError::HardwareUnavailable {
                operation: "laser_enable".to_string(),
                message: "laser is held by another measurement".to_string(),
            })
    }

    /// Releases the laser. Idempotent.
    pub fn release(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive() {
        let laser = LaserEnable::new();
        let other = laser.clone();
        laser.acquire().unwrap();
        assert!(other.is_enabled());
        assert!(other.acquire().is_err());
        laser.release();
        laser.release();
        assert!(!other.is_enabled());
        other.acquire().unwrap();
    }
}
