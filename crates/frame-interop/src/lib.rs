//! Renderer-to-compositor frame bridging.
//!
//! A renderer draws into an offscreen target owned by this crate (through
//! OpenGL or Vulkan). On every present the frame is read back, flipped and
//! swizzled into a CPU-writable staging texture, copied into a Direct3D11
//! texture that carries an OS shareable handle, and the compositor is told a
//! new frame exists. The compositor samples the shareable handle on its own
//! thread.
//!
//! [`SurfaceFactory`] is the common interface over the backends. The GL
//! backend is [`GlSurfaceFactory`], generic over the GL entry points
//! ([`GlApi`]) and the destination device ([`TextureDevice`]). On Windows it
//! is instantiated with WGL and D3D11; everywhere else the headless backends
//! stand in for both.

pub mod bridge;
pub mod config;
pub mod gl_backend;
pub mod headless;
pub mod notify;
pub mod region;
pub mod shared_texture;
pub mod target;
pub mod texture;
pub mod throttle;
pub mod transfer;

pub use bridge::{
    ClearBits, ContextBinding, DrawSurface, Registration, ResizeOutcome, StencilAction,
    StencilFace, SurfaceDescriptor, SurfaceFactory, TestFunction,
};
pub use config::BridgeConfig;
pub use gl_backend::{ContextHandle, GlApi, GlSurfaceFactory};
pub use notify::{FrameCallback, FrameNotifier, PresentSignal};
pub use region::Rect;
pub use shared_texture::{Generation, SharedTextureManager, TexturePublisher};
pub use texture::{PixelFormat, RawPtr, StagingView, TextureDevice};
pub use transfer::{ChannelOrder, FrameLayout, RowOrder, TransferDescriptor};

// Platform-specific implementations.

#[cfg(target_os = "windows")]
pub mod dx11;

#[cfg(feature = "vulkan")]
pub mod vulkan;

/// GL surface factory backed by WGL contexts and a D3D11 shared texture.
#[cfg(target_os = "windows")]
pub type WglD3D11Factory = GlSurfaceFactory<gl_backend::wgl::WglApi, dx11::D3D11TextureDevice>;

/// GL surface factory backed entirely by the software backends.
pub type HeadlessFactory =
    GlSurfaceFactory<headless::HeadlessGl, headless::HeadlessTextureDevice>;
