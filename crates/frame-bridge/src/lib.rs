//! Compositor integration for [`frame_interop`].
//!
//! [`BridgeHost`] owns one surface factory and the compositor's callbacks.
//! The [`ffi`] module exports it as a C ABI for a compositor plugin; Rust
//! hosts can use [`BridgeHost`] directly.
//!
//! Configuration comes from `FRAME_BRIDGE_*` environment variables (see
//! [`HostConfig::from_env`]).

pub mod config;
pub mod crash;
pub mod ffi;
pub mod host;
pub mod logging;

pub use config::{Backend, HostConfig};
pub use host::BridgeHost;
