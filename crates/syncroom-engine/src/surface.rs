//! The local playback surface the barriers poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Readiness queries answered by whatever renders the session locally.
pub trait PlaybackSurface: Send + Sync + 'static {
    /// Buffered enough to start playback.
    fn is_ready(&self) -> bool;

    /// The current activity has finished locally.
    fn is_finished(&self) -> bool;
}

/// A surface whose answers are set by hand.
///
/// Used by the CLI (driven from stdin) and by tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualSurface {
    ready: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl ManualSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::SeqCst);
    }

    /// Back to not ready, not finished.
    pub fn reset(&self) {
        self.set_ready(false);
        self.set_finished(false);
    }
}

impl PlaybackSurface for ManualSurface {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let surface = ManualSurface::new();
        let handle = surface.clone();
        handle.set_ready(true);
        assert!(surface.is_ready());
        assert!(!surface.is_finished());
        handle.set_finished(true);
        surface.reset();
        assert!(!handle.is_ready());
        assert!(!handle.is_finished());
    }
}
