//! Common interface for renderer-to-compositor surface bridging.

use std::ops::BitOr;

use crate::notify::{FrameCallback, FrameNotifier};
use crate::texture::{PixelFormat, RawPtr};

// ----------------------------------------------------------------------------
// Outcomes
// ----------------------------------------------------------------------------

/// Result of a surface resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The requested size equals the current size; nothing was touched.
    Unchanged,
    /// Render target and shared texture were recreated at the new size.
    Resized,
    /// The draw context is busy on another thread. The size is recorded and
    /// applied the next time the draw context is made current or presents.
    Deferred,
    /// Reallocation failed; the previous size stays in service.
    Failed,
}

/// Result of registering a notification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A callback was installed where none existed.
    Installed,
    /// An existing callback was replaced (or cleared).
    Replaced,
    /// Notifications are shut down; the callback was dropped.
    Rejected,
}

/// What the compositor needs to sample the shared texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    /// OS shareable handle for the shared texture.
    pub handle: RawPtr,
    /// Full allocated size of the shared texture.
    pub width: u32,
    pub height: u32,
    /// The part of the texture the compositor should show.
    pub visible_width: u32,
    pub visible_height: u32,
    pub format: PixelFormat,
    /// Handles are owned by the bridge; the compositor never releases them.
    pub has_release_callback: bool,
}

impl SurfaceDescriptor {
    /// Describe a `width` x `height` texture for a compositor requesting
    /// `requested_width` x `requested_height`. A zero request means "all of
    /// it"; anything larger than the texture is clamped.
    pub fn new(
        handle: RawPtr,
        width: u32,
        height: u32,
        requested_width: u32,
        requested_height: u32,
    ) -> Self {
        let visible = |requested: u32, actual: u32| {
            if requested == 0 {
                actual
            } else {
                requested.min(actual)
            }
        };
        Self {
            handle,
            width,
            height,
            visible_width: visible(requested_width, width),
            visible_height: visible(requested_height, height),
            format: PixelFormat::Bgra8,
            has_release_callback: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Renderer-facing state enums
// ----------------------------------------------------------------------------

/// Comparison used by depth and stencil tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFunction {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilFace {
    Front,
    Back,
    FrontAndBack,
}

impl StencilFace {
    pub(crate) fn covers_front(self) -> bool {
        matches!(self, StencilFace::Front | StencilFace::FrontAndBack)
    }

    pub(crate) fn covers_back(self) -> bool {
        matches!(self, StencilFace::Back | StencilFace::FrontAndBack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilAction {
    Keep,
    Zero,
    Replace,
    Increment,
    IncrementWrap,
    Decrement,
    DecrementWrap,
    Invert,
}

/// Buffers affected by [`DrawSurface::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearBits(u32);

impl ClearBits {
    pub const COLOR: ClearBits = ClearBits(1);
    pub const DEPTH: ClearBits = ClearBits(1 << 1);
    pub const STENCIL: ClearBits = ClearBits(1 << 2);
    pub const ALL: ClearBits = ClearBits(0b111);

    pub fn contains(self, other: ClearBits) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ClearBits {
    type Output = ClearBits;

    fn bitor(self, rhs: ClearBits) -> ClearBits {
        ClearBits(self.0 | rhs.0)
    }
}

// ----------------------------------------------------------------------------
// Context traits
// ----------------------------------------------------------------------------

/// A rendering context that can be bound to the calling thread.
pub trait ContextBinding: Send + Sync {
    /// Bind this context on the calling thread. Failures are logged.
    fn make_current(&self);

    /// Release this context from the calling thread.
    fn done_current(&self);
}

/// The renderer's draw context.
///
/// Every call operates on the calling thread and is a no-op (with a log line)
/// when the context cannot be made current there.
pub trait DrawSurface: ContextBinding {
    /// Ask for a new surface size. See [`ResizeOutcome`].
    fn resize(&self, width: u32, height: u32) -> ResizeOutcome;

    /// Transfer the current frame to the compositor and notify it.
    fn present(&self);

    /// Set viewport and scissor to the same rectangle.
    fn set_viewport(&self, x: i32, y: i32, width: u32, height: u32);

    fn set_scissor(&self, x: i32, y: i32, width: u32, height: u32);

    /// Bind `framebuffer`, or the bridge's offscreen target for `None`.
    /// The binding is remembered and used as the readback source on present.
    fn apply_framebuffer(&self, framebuffer: Option<u32>);

    fn set_clear_color(&self, rgba: [f32; 4]);
    fn clear(&self, bits: ClearBits);
    fn flush(&self);

    fn set_depth_test_enabled(&self, enabled: bool);
    fn set_depth_test_function(&self, function: TestFunction);

    fn set_stencil_test_enabled(&self, enabled: bool);
    fn set_stencil_function(&self, face: StencilFace, function: TestFunction);
    fn set_stencil_actions(
        &self,
        face: StencilFace,
        stencil_fail: StencilAction,
        depth_fail: StencilAction,
        pass: StencilAction,
    );
    fn set_stencil_reference_value(&self, value: u32);

    fn set_culling_enabled(&self, enabled: bool);

    fn renderer_name(&self) -> String;
    fn renderer_version(&self) -> String;
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

/// Common interface over the GL and Vulkan surface factories.
///
/// A factory owns the offscreen render target, the shared texture and the
/// frame notifier for one surface. Accessors are safe to call from any
/// thread; context operations bind to the calling thread.
pub trait SurfaceFactory: Send + Sync {
    /// Downcast to a concrete type, e.g. to reach a headless backend in tests.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Whether construction succeeded and a shared texture is published.
    fn is_valid(&self) -> bool;

    /// The draw context, created on first access.
    fn draw_context(&self) -> &dyn DrawSurface;

    /// The resource upload context, created on first access.
    fn upload_context(&self) -> &dyn ContextBinding;

    fn is_draw_context_created(&self) -> bool;
    fn is_upload_context_created(&self) -> bool;

    /// Resize render target and shared texture. Same as
    /// [`DrawSurface::resize`] but usable before the draw context exists.
    fn set_surface_size(&self, width: u32, height: u32) -> ResizeOutcome;

    /// Current size of the published shared texture, `(0, 0)` when none.
    fn dimensions(&self) -> (u32, u32);

    fn notifier(&self) -> &FrameNotifier;

    fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Registration {
        self.notifier().set_frame_callback(callback)
    }

    fn set_keep_alive_callback(&self, callback: Option<FrameCallback>) -> Registration {
        self.notifier().set_keep_alive_callback(callback)
    }

    /// OS shareable handle of the current shared texture, null when none.
    fn shared_texture_handle(&self) -> RawPtr;

    /// The destination device (`ID3D11Device*` on Windows).
    fn d3d11_device(&self) -> RawPtr;

    /// The current shared texture (`ID3D11Texture2D*` on Windows).
    fn d3d11_texture(&self) -> RawPtr;

    /// Descriptor for the compositor, `None` while no valid texture exists.
    fn sample(&self, requested_width: u32, requested_height: u32) -> Option<SurfaceDescriptor>;

    /// Stop all notifications and drop the callbacks. Called before teardown.
    fn shutdown(&self) {
        self.notifier().disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_visible_size() {
        let full = SurfaceDescriptor::new(RawPtr::NULL, 1024, 768, 0, 0);
        assert_eq!((full.visible_width, full.visible_height), (1024, 768));

        let smaller = SurfaceDescriptor::new(RawPtr::NULL, 1024, 768, 800, 600);
        assert_eq!((smaller.visible_width, smaller.visible_height), (800, 600));

        let larger = SurfaceDescriptor::new(RawPtr::NULL, 1024, 768, 4096, 100);
        assert_eq!((larger.visible_width, larger.visible_height), (1024, 100));

        assert_eq!(full.format, PixelFormat::Bgra8);
        assert!(!full.has_release_callback);
    }

    #[test]
    fn clear_bits_combine() {
        let bits = ClearBits::COLOR | ClearBits::STENCIL;
        assert!(bits.contains(ClearBits::COLOR));
        assert!(bits.contains(ClearBits::STENCIL));
        assert!(!bits.contains(ClearBits::DEPTH));
        assert!(ClearBits::ALL.contains(bits));
    }

    #[test]
    fn stencil_face_coverage() {
        assert!(StencilFace::FrontAndBack.covers_front());
        assert!(StencilFace::FrontAndBack.covers_back());
        assert!(!StencilFace::Front.covers_back());
        assert!(!StencilFace::Back.covers_front());
    }
}
