//! Tunables shared by every surface factory.

use std::time::Duration;

/// Tunables for frame notification, keep-alive and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Frame-ready notifications closer together than this are suppressed.
    pub min_notify_interval: Duration,
    /// Number of initial presents that also send a keep-alive signal to the
    /// renderer.
    pub keep_alive_frames: u32,
    /// Frame summaries and repeated transfer failures are logged once per
    /// this many occurrences.
    pub log_every_n_frames: u32,
    /// How long the transfer waits for the shared texture's keyed mutex.
    pub keyed_mutex_timeout_ms: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            // ~60Hz
            min_notify_interval: Duration::from_millis(16),
            // ~2 seconds at 60fps
            keep_alive_frames: 120,
            log_every_n_frames: 60,
            keyed_mutex_timeout_ms: 100,
        }
    }
}
