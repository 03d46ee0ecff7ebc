use std::sync::atomic::{AtomicBool, Ordering};

/// Host mechanism that re-invokes the background driver later.
///
/// Arming is idempotent: at most one wakeup is ever pending.
pub trait WakeupTimer: Send + Sync {
    /// Whether a re-invocation is already arranged.
    fn is_pending(&self) -> bool;

    /// Arrange a re-invocation.
    fn arm(&self);

    /// Drop any pending re-invocation.
    fn cancel(&self);

    /// Consume the pending wakeup. Returns `true` if one was pending.
    fn take_due(&self) -> bool;
}

/// Single-slot wakeup flag polled by [`super::BackgroundWorker`].
#[derive(Debug, Default)]
pub struct ManualTimer {
    pending: AtomicBool,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WakeupTimer for ManualTimer {
    fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn arm(&self) {
        self.pending.store(true, Ordering::Release);
    }

    fn cancel(&self) {
        self.pending.store(false, Ordering::Release);
    }

    fn take_due(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}
