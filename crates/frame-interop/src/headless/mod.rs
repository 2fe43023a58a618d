//! Software backends.
//!
//! [`HeadlessGl`] emulates the GL state the bridge touches (contexts bound
//! per thread, framebuffers, viewport and scissor, color clears) with plain
//! memory. [`HeadlessTextureDevice`] stands in for the D3D11 device with
//! process-local "handles". Together they run the whole GL bridge without a
//! GPU, which is what CI and non-Windows hosts use.

mod context;
mod device;

pub use context::HeadlessGl;
pub use device::{HeadlessHandle, HeadlessStaging, HeadlessTexture, HeadlessTextureDevice};
