//! Vulkan render backend.
//!
//! The renderer draws into images owned by [`VulkanSurfaceFactory`]. Present
//! copies the viewport region into a host-visible buffer and hands the rows
//! to the same staging-and-copy stage the GL backend uses.

mod context;
pub mod device;
mod factory;
pub mod target;

pub use context::{VulkanDrawContext, VulkanUploadContext};
pub use device::VulkanDevice;
pub use factory::{DrawState, StencilFaceState, VulkanSurfaceFactory};
pub use target::VulkanTarget;
