// Idle session watchdog

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::ota::{CancelReason, SessionWatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    /// An upload stalled; its cancel was requested.
    CancelledSession,
    /// Nothing uploaded for the whole timeout; update mode can be closed.
    Expired,
}

/// One watchdog tick. Never touches the engine directly, only the shared watch.
pub fn check(watch: &SessionWatch, timeout: Duration) -> WatchdogAction {
    if watch.idle_for() < timeout {
        return WatchdogAction::None;
    }
    if watch.is_active() {
        if watch.request_cancel(CancelReason::IdleTimeout) {
            warn!(
                "OTA session idle for {}s after {} bytes, cancelling",
                timeout.as_secs(),
                watch.received()
            );
            return WatchdogAction::CancelledSession;
        }
        return WatchdogAction::None;
    }
    WatchdogAction::Expired
}

pub struct IdleWatchdog {
    stop: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IdleWatchdog {
    pub fn spawn(watch: Arc<SessionWatch>, timeout: Duration, poll: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let expired = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_expired = Arc::clone(&expired);
        let handle = thread::Builder::new()
            .name("ota_watchdog".into())
            .stack_size(6144)
            .spawn(move || {
                info!("OTA idle watchdog started ({}s timeout)", timeout.as_secs());
                while !thread_stop.load(Ordering::Relaxed) {
                    if check(&watch, timeout) == WatchdogAction::Expired
                        && !thread_expired.swap(true, Ordering::SeqCst)
                    {
                        warn!("No OTA activity for {}s", timeout.as_secs());
                    }
                    thread::sleep(poll);
                }
            })?;

        Ok(Self {
            stop,
            expired,
            handle: Some(handle),
        })
    }

    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::BootValidated;
    use crate::ota::{BankId, ImageStore, MemoryImageStore, TransferEngine, TransferError};

    #[test]
    fn fresh_watch_is_not_idle() {
        let watch = SessionWatch::new();
        assert_eq!(check(&watch, Duration::from_secs(60)), WatchdogAction::None);
    }

    #[test]
    fn stalled_session_is_cancelled_through_engine() {
        let mut engine = TransferEngine::new(MemoryImageStore::new(4096), BootValidated::for_tests(BankId::A));
        let watch = engine.watch();
        engine.begin().unwrap();

        assert_eq!(check(&watch, Duration::ZERO), WatchdogAction::CancelledSession);
        let err = engine.finish().unwrap_err();
        assert!(matches!(
            err,
            TransferError::Cancelled {
                reason: CancelReason::IdleTimeout,
                ..
            }
        ));
        assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::A);
    }

    #[test]
    fn idle_device_expires() {
        let watch = SessionWatch::new();
        assert_eq!(check(&watch, Duration::ZERO), WatchdogAction::Expired);
    }

    #[test]
    fn thread_raises_expired_flag_and_stops_on_drop() {
        let watch = Arc::new(SessionWatch::new());
        let watchdog = IdleWatchdog::spawn(watch, Duration::ZERO, Duration::from_millis(1)).unwrap();
        for _ in 0..500 {
            if watchdog.expired() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(watchdog.expired());
        drop(watchdog);
    }
}
