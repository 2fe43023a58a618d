//! Frame-ready notification and renderer keep-alive.
//!
//! The compositor is told about new frames at most once per
//! [`BridgeConfig::min_notify_interval`], and never re-entrantly: a
//! notification that arrives while another is being dispatched is dropped.
//! For the first [`BridgeConfig::keep_alive_frames`] presents the renderer
//! additionally receives a keep-alive signal so it keeps producing frames
//! before the compositor starts pulling.
//!
//! Suppressed notifications are not replayed; the next present after the
//! interval carries the latest frame.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::bridge::Registration;
use crate::config::BridgeConfig;

/// Callback invoked on the presenting thread.
pub type FrameCallback = Arc<dyn Fn() + Send + Sync>;

const NEVER: u64 = u64::MAX;

/// What a present triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresentSignal {
    pub notified: bool,
    pub kept_alive: bool,
}

pub struct FrameNotifier {
    epoch: Instant,
    min_interval_ns: u64,
    /// Nanoseconds since `epoch` of the last dispatched notification.
    last_notify_ns: AtomicU64,
    /// Set while a notification is being dispatched.
    pending: AtomicBool,
    keep_alive_frames: u32,
    keep_alive_budget: AtomicU32,
    enabled: AtomicBool,
    frame_callback: RwLock<Option<FrameCallback>>,
    keep_alive_callback: RwLock<Option<FrameCallback>>,
    dispatched: AtomicU64,
    suppressed: AtomicU64,
}

impl FrameNotifier {
    pub fn new(config: &BridgeConfig) -> Self {
        Self::with_epoch(config, Instant::now())
    }

    /// A notifier whose clock starts at `epoch`. Timestamps passed to the
    /// `*_at` methods must not precede it.
    pub fn with_epoch(config: &BridgeConfig, epoch: Instant) -> Self {
        Self {
            epoch,
            min_interval_ns: duration_ns(config.min_notify_interval),
            last_notify_ns: AtomicU64::new(NEVER),
            pending: AtomicBool::new(false),
            keep_alive_frames: config.keep_alive_frames,
            keep_alive_budget: AtomicU32::new(config.keep_alive_frames),
            enabled: AtomicBool::new(true),
            frame_callback: RwLock::new(None),
            keep_alive_callback: RwLock::new(None),
            dispatched: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Registration {
        self.register(&self.frame_callback, callback)
    }

    pub fn set_keep_alive_callback(&self, callback: Option<FrameCallback>) -> Registration {
        self.register(&self.keep_alive_callback, callback)
    }

    fn register(
        &self,
        slot: &RwLock<Option<FrameCallback>>,
        callback: Option<FrameCallback>,
    ) -> Registration {
        if !self.is_enabled() {
            return Registration::Rejected;
        }
        match std::mem::replace(&mut *slot.write(), callback) {
            Some(_) => Registration::Replaced,
            None => Registration::Installed,
        }
    }

    pub fn has_frame_callback(&self) -> bool {
        self.frame_callback.read().is_some()
    }

    pub fn has_keep_alive_callback(&self) -> bool {
        self.keep_alive_callback.read().is_some()
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Notify the compositor of a new frame, subject to rate limiting.
    /// Returns whether a notification was dispatched.
    pub fn notify_frame_ready(&self) -> bool {
        self.notify_frame_ready_at(Instant::now())
    }

    pub fn notify_frame_ready_at(&self, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let now_ns = duration_ns(now.saturating_duration_since(self.epoch));
        if self.within_interval(now_ns) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Another thread may have dispatched between the check and the claim.
        if self.within_interval(now_ns) {
            self.pending.store(false, Ordering::Release);
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.last_notify_ns.store(now_ns, Ordering::Release);
        let callback = self.frame_callback.read().clone();
        if let Some(callback) = callback {
            callback();
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.pending.store(false, Ordering::Release);
        true
    }

    /// Send one keep-alive signal if budget remains.
    pub fn keep_alive(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let consumed = self
            .keep_alive_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| b.checked_sub(1))
            .is_ok();
        if consumed {
            let callback = self.keep_alive_callback.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        consumed
    }

    /// Everything a present triggers: keep-alive (while budget remains) and,
    /// when the frame was transferred, a rate-limited frame-ready
    /// notification.
    pub fn on_present(&self, transferred: bool) -> PresentSignal {
        self.on_present_at(transferred, Instant::now())
    }

    pub fn on_present_at(&self, transferred: bool, now: Instant) -> PresentSignal {
        let kept_alive = self.keep_alive();
        let notified = transferred && self.notify_frame_ready_at(now);
        PresentSignal {
            notified,
            kept_alive,
        }
    }

    fn within_interval(&self, now_ns: u64) -> bool {
        let last = self.last_notify_ns.load(Ordering::Acquire);
        last != NEVER && now_ns.saturating_sub(last) < self.min_interval_ns
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Refill the keep-alive budget, e.g. after the surface was recreated.
    pub fn reset_keep_alive(&self) {
        self.keep_alive_budget
            .store(self.keep_alive_frames, Ordering::Release);
    }

    pub fn remaining_keep_alive(&self) -> u32 {
        self.keep_alive_budget.load(Ordering::Acquire)
    }

    /// Stop notifying and drop both callbacks. Subsequent registrations are
    /// rejected. A dispatch already running completes.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            debug!(
                dispatched = self.dispatched(),
                suppressed = self.suppressed(),
                "Frame notifications disabled"
            );
        }
        self.frame_callback.write().take();
        self.keep_alive_callback.write().take();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_nanos(self.min_interval_ns)
    }
}

impl std::fmt::Debug for FrameNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameNotifier")
            .field("enabled", &self.is_enabled())
            .field("min_interval", &self.min_interval())
            .field("keep_alive_remaining", &self.remaining_keep_alive())
            .field("dispatched", &self.dispatched())
            .field("suppressed", &self.suppressed())
            .finish()
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, FrameCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn notifier(keep_alive_frames: u32) -> (FrameNotifier, Instant) {
        let epoch = Instant::now();
        let config = BridgeConfig {
            keep_alive_frames,
            ..BridgeConfig::default()
        };
        (FrameNotifier::with_epoch(&config, epoch), epoch)
    }

    #[test]
    fn rapid_notifications_are_throttled() {
        let (n, t0) = notifier(0);
        let (count, cb) = counter();
        assert_eq!(n.set_frame_callback(Some(cb)), Registration::Installed);

        assert!(n.notify_frame_ready_at(t0));
        assert!(!n.notify_frame_ready_at(t0 + Duration::from_millis(5)));
        assert!(n.notify_frame_ready_at(t0 + Duration::from_millis(20)));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(n.suppressed(), 1);
    }

    #[test]
    fn notifications_at_120hz_are_roughly_halved() {
        let (n, t0) = notifier(0);
        let (count, cb) = counter();
        n.set_frame_callback(Some(cb));

        let period = Duration::from_nanos(8_333_333);
        for i in 0..200u32 {
            n.notify_frame_ready_at(t0 + period * i);
        }
        let delivered = count.load(Ordering::SeqCst);
        assert!((95..=105).contains(&delivered), "delivered {delivered}");
    }

    #[test]
    fn keep_alive_budget_is_exact() {
        let (n, t0) = notifier(120);
        let (count, cb) = counter();
        n.set_keep_alive_callback(Some(cb));

        let kept: usize = (0..300u32)
            .filter(|i| {
                n.on_present_at(true, t0 + Duration::from_millis(*i as u64))
                    .kept_alive
            })
            .count();
        assert_eq!(kept, 120);
        assert_eq!(count.load(Ordering::SeqCst), 120);
        assert_eq!(n.remaining_keep_alive(), 0);

        n.reset_keep_alive();
        assert_eq!(n.remaining_keep_alive(), 120);
    }

    #[test]
    fn dropped_transfer_still_keeps_alive() {
        let (n, t0) = notifier(1);
        let signal = n.on_present_at(false, t0);
        assert!(signal.kept_alive);
        assert!(!signal.notified);
        assert_eq!(n.dispatched(), 0);
    }

    #[test]
    fn notification_without_callback_still_counts() {
        let (n, t0) = notifier(0);
        assert!(n.notify_frame_ready_at(t0));
        assert!(!n.notify_frame_ready_at(t0 + Duration::from_millis(1)));
    }

    #[test]
    fn callbacks_are_replaced() {
        let (n, t0) = notifier(0);
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        assert_eq!(n.set_frame_callback(Some(cb1)), Registration::Installed);
        assert_eq!(n.set_frame_callback(Some(cb2)), Registration::Replaced);
        n.notify_frame_ready_at(t0);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_notifier_is_silent() {
        let (n, t0) = notifier(10);
        let (count, cb) = counter();
        n.set_frame_callback(Some(cb.clone()));
        n.set_keep_alive_callback(Some(cb.clone()));
        n.disable();

        assert_eq!(n.on_present_at(true, t0), PresentSignal::default());
        assert_eq!(n.set_frame_callback(Some(cb)), Registration::Rejected);
        assert!(!n.has_frame_callback());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reentrant_notification_is_dropped() {
        let (n, t0) = notifier(0);
        let n = Arc::new(n);
        let inner = Arc::new(AtomicBool::new(true));
        let (n2, inner2) = (Arc::downgrade(&n), inner.clone());
        n.set_frame_callback(Some(Arc::new(move || {
            if let Some(n) = n2.upgrade() {
                // Far enough in the future to pass the interval check.
                let nested = n.notify_frame_ready_at(t0 + Duration::from_secs(1));
                inner2.store(nested, Ordering::SeqCst);
            }
        })));

        assert!(n.notify_frame_ready_at(t0));
        assert!(!inner.load(Ordering::SeqCst));
    }
}
