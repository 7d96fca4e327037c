// Lock-free view of the upload session, shared with the idle watchdog and status endpoint

use core::fmt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancel from the host application.
    Requested,
    /// No data arrived for longer than the configured idle timeout.
    IdleTimeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancel requested"),
            CancelReason::IdleTimeout => f.write_str("idle timeout"),
        }
    }
}

const NO_CANCEL: u8 = 0;

impl CancelReason {
    fn encode(self) -> u8 {
        match self {
            CancelReason::Requested => 1,
            CancelReason::IdleTimeout => 2,
        }
    }

    fn decode(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CancelReason::Requested),
            2 => Some(CancelReason::IdleTimeout),
            _ => None,
        }
    }
}

/// Written by the engine on every chunk; read and poked by other threads without the engine lock.
#[derive(Debug)]
pub struct SessionWatch {
    epoch: Instant,
    active: AtomicBool,
    received: AtomicUsize,
    last_activity_ms: AtomicU64,
    cancel: AtomicU8,
}

impl SessionWatch {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            active: AtomicBool::new(false),
            received: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(0),
            cancel: AtomicU8::new(NO_CANCEL),
        }
    }

    pub(crate) fn started(&self) {
        self.cancel.store(NO_CANCEL, Ordering::SeqCst);
        self.received.store(0, Ordering::SeqCst);
        self.touch(0);
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn touch(&self, received: usize) {
        self.received.store(received, Ordering::Relaxed);
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn finished(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.cancel.store(NO_CANCEL, Ordering::SeqCst);
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Consumed by the engine at its next call.
    pub(crate) fn take_cancel(&self) -> Option<CancelReason> {
        CancelReason::decode(self.cancel.swap(NO_CANCEL, Ordering::SeqCst))
    }

    /// Asks the engine to abort the active session. Returns false when nothing is in flight.
    pub fn request_cancel(&self, reason: CancelReason) -> bool {
        if !self.is_active() {
            return false;
        }
        self.cancel.store(reason.encode(), Ordering::SeqCst);
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }

    /// Time since the last chunk, session start or session end.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Default for SessionWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_needs_an_active_session() {
        let watch = SessionWatch::new();
        assert!(!watch.request_cancel(CancelReason::Requested));
        assert_eq!(watch.take_cancel(), None);

        watch.started();
        assert!(watch.request_cancel(CancelReason::IdleTimeout));
        assert_eq!(watch.take_cancel(), Some(CancelReason::IdleTimeout));
        assert_eq!(watch.take_cancel(), None);
    }

    #[test]
    fn finishing_clears_pending_cancel() {
        let watch = SessionWatch::new();
        watch.started();
        watch.touch(1024);
        assert_eq!(watch.received(), 1024);
        watch.request_cancel(CancelReason::Requested);
        watch.finished();
        assert!(!watch.is_active());
        assert_eq!(watch.take_cancel(), None);
    }
}
