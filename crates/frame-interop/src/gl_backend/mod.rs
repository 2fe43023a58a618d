//! OpenGL render backend.
//!
//! [`GlApi`] is the narrow slice of GL and context management the bridge
//! needs. It is implemented by [`wgl::WglApi`] on Windows and by
//! [`crate::headless::HeadlessGl`] everywhere.

mod context;
mod factory;

#[cfg(target_os = "windows")]
pub mod wgl;

pub use context::{DrawContext, UploadContext};
pub use factory::GlSurfaceFactory;
pub(crate) use context::ContextSwitch;

use gl::types::{GLbitfield, GLenum, GLuint};

use crate::region::Rect;

/// Opaque identity of a GL context, together with the drawable it is bound
/// with. Two handles are equal only if both parts match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    context: usize,
    drawable: usize,
}

impl ContextHandle {
    /// `None` for a null context.
    pub fn new(context: usize, drawable: usize) -> Option<Self> {
        (context != 0).then_some(Self { context, drawable })
    }

    /// Handle for an in-process context. Ids start at 1.
    pub(crate) fn software(id: usize) -> Self {
        Self {
            context: id.max(1),
            drawable: 0,
        }
    }

    pub fn context(self) -> usize {
        self.context
    }

    pub fn drawable(self) -> usize {
        self.drawable
    }
}

/// GL entry points and context management.
///
/// Everything except the context queries operates on the context current on
/// the calling thread. Object-specific calls (`attach`, `framebuffer_status`,
/// ...) bind the given framebuffer and leave it bound.
pub trait GlApi: Send + Sync + 'static {
    /// The context renderers draw with.
    fn draw_context(&self) -> ContextHandle;

    /// The context sharing objects with the draw context, for uploads.
    fn upload_context(&self) -> ContextHandle;

    fn current_context(&self) -> Option<ContextHandle>;

    /// Bind `context` on the calling thread, or release the current one for
    /// `None`. Returns `false` when the platform refuses, e.g. because the
    /// context is current on another thread.
    fn make_current(&self, context: Option<ContextHandle>) -> bool;

    // Objects
    fn gen_framebuffer(&self) -> GLuint;
    fn gen_texture(&self) -> GLuint;
    fn gen_renderbuffer(&self) -> GLuint;
    fn delete_framebuffer(&self, framebuffer: GLuint);
    fn delete_texture(&self, texture: GLuint);
    fn delete_renderbuffer(&self, renderbuffer: GLuint);

    /// Allocate RGBA8 storage for `texture`.
    fn color_storage(&self, texture: GLuint, width: u32, height: u32);

    /// Allocate combined 24-bit depth / 8-bit stencil storage.
    fn depth_stencil_storage(&self, renderbuffer: GLuint, width: u32, height: u32);

    /// Attach `color` as color attachment 0 and `depth_stencil` as the
    /// depth-stencil attachment of `framebuffer`.
    fn attach(&self, framebuffer: GLuint, color: GLuint, depth_stencil: GLuint);

    /// Declare color attachment 0 as the draw buffer of `framebuffer`.
    fn declare_draw_buffer(&self, framebuffer: GLuint);

    fn framebuffer_status(&self, framebuffer: GLuint) -> GLenum;

    fn bind_framebuffer(&self, framebuffer: GLuint);
    fn framebuffer_binding(&self) -> GLuint;

    // State
    fn viewport(&self, rect: Rect);
    fn current_viewport(&self) -> Rect;
    fn scissor(&self, rect: Rect);
    fn current_scissor(&self) -> Rect;
    fn set_capability(&self, capability: GLenum, enabled: bool);
    fn is_enabled(&self, capability: GLenum) -> bool;
    fn depth_func(&self, function: GLenum);
    fn stencil_func(&self, face: GLenum, function: GLenum, reference: i32, mask: u32);
    fn stencil_op(&self, face: GLenum, stencil_fail: GLenum, depth_fail: GLenum, pass: GLenum);
    fn clear_color(&self, rgba: [f32; 4]);
    fn clear(&self, mask: GLbitfield);

    // Synchronization and readback
    fn flush(&self);
    fn finish(&self);

    /// Read `region` of the bound framebuffer as RGBA8, bottom row first,
    /// into `out` (at least `region.byte_len()` bytes).
    fn read_pixels(&self, region: Rect, out: &mut [u8]);

    fn get_string(&self, name: GLenum) -> Option<String>;
}

pub(crate) fn is_complete(status: GLenum) -> bool {
    status == gl::FRAMEBUFFER_COMPLETE
}

pub(crate) fn status_name(status: GLenum) -> &'static str {
    match status {
        gl::FRAMEBUFFER_COMPLETE => "complete",
        gl::FRAMEBUFFER_UNDEFINED => "undefined",
        gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT => "incomplete attachment",
        gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT => "missing attachment",
        gl::FRAMEBUFFER_INCOMPLETE_DRAW_BUFFER => "incomplete draw buffer",
        gl::FRAMEBUFFER_INCOMPLETE_READ_BUFFER => "incomplete read buffer",
        gl::FRAMEBUFFER_UNSUPPORTED => "unsupported",
        gl::FRAMEBUFFER_INCOMPLETE_MULTISAMPLE => "incomplete multisample",
        _ => "unknown status",
    }
}
