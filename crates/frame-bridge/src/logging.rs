//! Process-wide `tracing` subscriber.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

static INIT: Once = Once::new();

/// Install a stderr fmt subscriber once per process.
///
/// A host application that already installed a global subscriber keeps it;
/// this crate's events then flow into theirs.
pub fn init(filter: Option<&str>) {
    INIT.call_once(|| {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(build_filter(filter))
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!("Logging initialized");
        }
    });
}

/// `filter` if it parses, else `RUST_LOG`, else `info`.
pub fn build_filter(filter: Option<&str>) -> EnvFilter {
    filter
        .and_then(|directives| match EnvFilter::try_new(directives) {
            Ok(filter) => Some(filter),
            Err(e) => {
                eprintln!("frame-bridge: invalid log filter {directives:?}: {e}");
                None
            }
        })
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
