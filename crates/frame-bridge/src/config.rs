//! Host configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use frame_interop::BridgeConfig;
use tracing::warn;

pub const ENV_BACKEND: &str = "FRAME_BRIDGE_BACKEND";
pub const ENV_LOG: &str = "FRAME_BRIDGE_LOG";
pub const ENV_DUMP_DIR: &str = "FRAME_BRIDGE_DUMP_DIR";
pub const ENV_KEEP_ALIVE_FRAMES: &str = "FRAME_BRIDGE_KEEP_ALIVE_FRAMES";
pub const ENV_NOTIFY_INTERVAL_MS: &str = "FRAME_BRIDGE_NOTIFY_INTERVAL_MS";

/// Which surface factory the host builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// WGL + D3D11 on Windows, headless elsewhere.
    #[default]
    Auto,
    Wgl,
    Vulkan,
    Headless,
}

impl Backend {
    /// The concrete backend `Auto` stands for on this platform.
    pub fn resolve(self) -> Backend {
        match self {
            Backend::Auto if cfg!(target_os = "windows") => Backend::Wgl,
            Backend::Auto => Backend::Headless,
            other => other,
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Backend::Auto),
            "wgl" | "gl" | "opengl" => Ok(Backend::Wgl),
            "vulkan" | "vk" => Ok(Backend::Vulkan),
            "headless" | "software" => Ok(Backend::Headless),
            other => bail!("unknown backend {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub backend: Backend,
    /// `EnvFilter` directives; `RUST_LOG` and then `info` apply when unset.
    pub log_filter: Option<String>,
    /// Where crash dumps go; a `frame_bridge` directory under the system
    /// temp directory when unset.
    pub dump_dir: Option<PathBuf>,
    pub bridge: BridgeConfig,
}

impl HostConfig {
    /// Read the `FRAME_BRIDGE_*` variables. Malformed values are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`HostConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = HostConfig::default();

        if let Some(value) = lookup(ENV_BACKEND) {
            match value.parse() {
                Ok(backend) => config.backend = backend,
                Err(e) => warn!("Ignoring {ENV_BACKEND}: {e:#}"),
            }
        }
        config.log_filter = lookup(ENV_LOG).filter(|v| !v.trim().is_empty());
        config.dump_dir = lookup(ENV_DUMP_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(value) = lookup(ENV_KEEP_ALIVE_FRAMES) {
            match parse_number(ENV_KEEP_ALIVE_FRAMES, &value) {
                Ok(frames) => config.bridge.keep_alive_frames = frames,
                Err(e) => warn!("{e:#}"),
            }
        }
        if let Some(value) = lookup(ENV_NOTIFY_INTERVAL_MS) {
            match parse_number(ENV_NOTIFY_INTERVAL_MS, &value) {
                Ok(ms) => config.bridge.min_notify_interval = Duration::from_millis(u64::from(ms)),
                Err(e) => warn!("{e:#}"),
            }
        }
        config
    }

    pub fn dump_dir(&self) -> PathBuf {
        self.dump_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("frame_bridge"))
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Ignoring {key}={value:?}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = HostConfig::from_lookup(lookup(&[]));
        assert_eq!(config.backend, Backend::Auto);
        assert!(config.log_filter.is_none());
        assert!(config.dump_dir.is_none());
        assert_eq!(config.bridge.keep_alive_frames, 120);
        assert_eq!(config.bridge.min_notify_interval, Duration::from_millis(16));
    }

    #[test]
    fn reads_all_variables() {
        let config = HostConfig::from_lookup(lookup(&[
            (ENV_BACKEND, "Headless"),
            (ENV_LOG, "frame_interop=debug"),
            (ENV_DUMP_DIR, "/tmp/dumps"),
            (ENV_KEEP_ALIVE_FRAMES, "30"),
            (ENV_NOTIFY_INTERVAL_MS, " 8 "),
        ]));
        assert_eq!(config.backend, Backend::Headless);
        assert_eq!(config.log_filter.as_deref(), Some("frame_interop=debug"));
        assert_eq!(config.dump_dir(), PathBuf::from("/tmp/dumps"));
        assert_eq!(config.bridge.keep_alive_frames, 30);
        assert_eq!(config.bridge.min_notify_interval, Duration::from_millis(8));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = HostConfig::from_lookup(lookup(&[
            (ENV_BACKEND, "metal"),
            (ENV_LOG, "  "),
            (ENV_KEEP_ALIVE_FRAMES, "-1"),
            (ENV_NOTIFY_INTERVAL_MS, "soon"),
        ]));
        assert_eq!(config.backend, Backend::Auto);
        assert!(config.log_filter.is_none());
        assert_eq!(config.bridge.keep_alive_frames, 120);
        assert_eq!(config.bridge.min_notify_interval, Duration::from_millis(16));
    }

    #[test]
    fn backend_names() {
        assert_eq!("vk".parse::<Backend>().unwrap(), Backend::Vulkan);
        assert_eq!("OpenGL".parse::<Backend>().unwrap(), Backend::Wgl);
        assert_eq!("".parse::<Backend>().unwrap(), Backend::Auto);
        assert!("dx12".parse::<Backend>().is_err());
        assert_ne!(Backend::Auto.resolve(), Backend::Auto);
        assert_eq!(Backend::Vulkan.resolve(), Backend::Vulkan);
    }
}
