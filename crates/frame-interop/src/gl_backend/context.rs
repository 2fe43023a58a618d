//! Draw and upload contexts handed to the renderer.

use std::sync::Arc;

use gl::types::{GLbitfield, GLenum};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::factory::GlSurface;
use super::{ContextHandle, GlApi};
use crate::bridge::{
    ClearBits, ContextBinding, DrawSurface, ResizeOutcome, StencilAction, StencilFace,
    TestFunction,
};
use crate::region::Rect;
use crate::texture::TextureDevice;

// ----------------------------------------------------------------------------
// Save / restore
// ----------------------------------------------------------------------------

/// Makes a context current for a scope and restores exactly what was current
/// before (including nothing) when dropped. If the target was already
/// current, nothing is switched in either direction.
pub(crate) struct ContextSwitch<'a, G: GlApi + ?Sized> {
    gl: &'a G,
    previous: Option<ContextHandle>,
    switched: bool,
}

impl<'a, G: GlApi + ?Sized> ContextSwitch<'a, G> {
    /// `None` when `target` cannot be bound on this thread.
    pub(crate) fn enter(gl: &'a G, target: ContextHandle) -> Option<Self> {
        let previous = gl.current_context();
        if previous == Some(target) {
            return Some(Self {
                gl,
                previous,
                switched: false,
            });
        }
        if !gl.make_current(Some(target)) {
            return None;
        }
        Some(Self {
            gl,
            previous,
            switched: true,
        })
    }
}

impl<G: GlApi + ?Sized> Drop for ContextSwitch<'_, G> {
    fn drop(&mut self) {
        if self.switched && !self.gl.make_current(self.previous) {
            warn!("Failed to restore previous GL context {:?}", self.previous);
        }
    }
}

// ----------------------------------------------------------------------------
// Enum conversions
// ----------------------------------------------------------------------------

fn test_function(function: TestFunction) -> GLenum {
    match function {
        TestFunction::Never => gl::NEVER,
        TestFunction::Less => gl::LESS,
        TestFunction::Equal => gl::EQUAL,
        TestFunction::LessOrEqual => gl::LEQUAL,
        TestFunction::Greater => gl::GREATER,
        TestFunction::NotEqual => gl::NOTEQUAL,
        TestFunction::GreaterOrEqual => gl::GEQUAL,
        TestFunction::Always => gl::ALWAYS,
    }
}

fn stencil_face(face: StencilFace) -> GLenum {
    match face {
        StencilFace::Front => gl::FRONT,
        StencilFace::Back => gl::BACK,
        StencilFace::FrontAndBack => gl::FRONT_AND_BACK,
    }
}

fn stencil_action(action: StencilAction) -> GLenum {
    match action {
        StencilAction::Keep => gl::KEEP,
        StencilAction::Zero => gl::ZERO,
        StencilAction::Replace => gl::REPLACE,
        StencilAction::Increment => gl::INCR,
        StencilAction::IncrementWrap => gl::INCR_WRAP,
        StencilAction::Decrement => gl::DECR,
        StencilAction::DecrementWrap => gl::DECR_WRAP,
        StencilAction::Invert => gl::INVERT,
    }
}

fn clear_mask(bits: ClearBits) -> GLbitfield {
    let mut mask = 0;
    if bits.contains(ClearBits::COLOR) {
        mask |= gl::COLOR_BUFFER_BIT;
    }
    if bits.contains(ClearBits::DEPTH) {
        mask |= gl::DEPTH_BUFFER_BIT;
    }
    if bits.contains(ClearBits::STENCIL) {
        mask |= gl::STENCIL_BUFFER_BIT;
    }
    mask
}

// ----------------------------------------------------------------------------
// Draw context
// ----------------------------------------------------------------------------

/// Stencil function and reference are set separately by renderers but GL
/// takes them in one call, so the last of each is kept here.
#[derive(Debug, Clone, Copy)]
struct StencilParams {
    front: GLenum,
    back: GLenum,
    reference: i32,
}

const STENCIL_MASK: u32 = 0xFF;

/// The context renderers draw with. Created lazily by
/// [`GlSurfaceFactory::draw_context`](crate::SurfaceFactory::draw_context).
pub struct DrawContext<G: GlApi, D: TextureDevice> {
    surface: Arc<GlSurface<G, D>>,
    stencil: Mutex<StencilParams>,
}

impl<G: GlApi, D: TextureDevice> DrawContext<G, D> {
    pub(crate) fn new(surface: Arc<GlSurface<G, D>>) -> Self {
        debug!("Draw context created");
        Self {
            surface,
            stencil: Mutex::new(StencilParams {
                front: gl::ALWAYS,
                back: gl::ALWAYS,
                reference: 0,
            }),
        }
    }

    fn handle(&self) -> ContextHandle {
        self.surface.gl.draw_context()
    }

    /// The GL entry points, if this context is current on the calling thread.
    fn current_gl(&self, operation: &str) -> Option<&G> {
        let gl = &self.surface.gl;
        if gl.current_context() == Some(self.handle()) {
            Some(gl)
        } else {
            debug!("{operation} ignored: draw context is not current on this thread");
            None
        }
    }

    fn query_string(&self, name: GLenum) -> String {
        let gl = &self.surface.gl;
        match ContextSwitch::enter(gl, self.handle()) {
            Some(_switch) => gl.get_string(name).unwrap_or_default(),
            None => {
                warn!("Cannot query GL string 0x{:X}: draw context busy", name);
                String::new()
            }
        }
    }
}

impl<G: GlApi, D: TextureDevice> ContextBinding for DrawContext<G, D> {
    fn make_current(&self) {
        let gl = &self.surface.gl;
        let handle = self.handle();
        if !gl.make_current(Some(handle)) {
            error!("Failed to make draw context current");
            return;
        }
        if gl.current_context() != Some(handle) {
            error!("Draw context not current after make_current");
            return;
        }
        self.surface.apply_pending_resize();
        self.surface.bind_offscreen();
    }

    fn done_current(&self) {
        let gl = &self.surface.gl;
        if gl.current_context() == Some(self.handle()) {
            gl.bind_framebuffer(0);
            gl.make_current(None);
        }
    }
}

impl<G: GlApi, D: TextureDevice> DrawSurface for DrawContext<G, D> {
    fn resize(&self, width: u32, height: u32) -> ResizeOutcome {
        self.surface.resize(width, height)
    }

    fn present(&self) {
        self.surface.present();
    }

    fn set_viewport(&self, x: i32, y: i32, width: u32, height: u32) {
        if let Some(gl) = self.current_gl("set_viewport") {
            let rect = Rect::new(x, y, width, height);
            gl.viewport(rect);
            gl.scissor(rect);
        }
    }

    fn set_scissor(&self, x: i32, y: i32, width: u32, height: u32) {
        if let Some(gl) = self.current_gl("set_scissor") {
            gl.scissor(Rect::new(x, y, width, height));
        }
    }

    fn apply_framebuffer(&self, framebuffer: Option<u32>) {
        if self.current_gl("apply_framebuffer").is_none() {
            return;
        }
        match framebuffer {
            Some(fbo) => self.surface.bind_framebuffer(fbo),
            None => self.surface.bind_offscreen(),
        }
    }

    fn set_clear_color(&self, rgba: [f32; 4]) {
        if let Some(gl) = self.current_gl("set_clear_color") {
            gl.clear_color(rgba);
        }
    }

    fn clear(&self, bits: ClearBits) {
        if let Some(gl) = self.current_gl("clear") {
            gl.clear(clear_mask(bits));
        }
    }

    fn flush(&self) {
        if let Some(gl) = self.current_gl("flush") {
            gl.flush();
        }
    }

    fn set_depth_test_enabled(&self, enabled: bool) {
        if let Some(gl) = self.current_gl("set_depth_test_enabled") {
            gl.set_capability(gl::DEPTH_TEST, enabled);
        }
    }

    fn set_depth_test_function(&self, function: TestFunction) {
        if let Some(gl) = self.current_gl("set_depth_test_function") {
            gl.depth_func(test_function(function));
        }
    }

    fn set_stencil_test_enabled(&self, enabled: bool) {
        if let Some(gl) = self.current_gl("set_stencil_test_enabled") {
            gl.set_capability(gl::STENCIL_TEST, enabled);
        }
    }

    fn set_stencil_function(&self, face: StencilFace, function: TestFunction) {
        let Some(gl) = self.current_gl("set_stencil_function") else {
            return;
        };
        let function = test_function(function);
        let mut stencil = self.stencil.lock();
        if face.covers_front() {
            stencil.front = function;
        }
        if face.covers_back() {
            stencil.back = function;
        }
        gl.stencil_func(stencil_face(face), function, stencil.reference, STENCIL_MASK);
    }

    fn set_stencil_actions(
        &self,
        face: StencilFace,
        stencil_fail: StencilAction,
        depth_fail: StencilAction,
        pass: StencilAction,
    ) {
        if let Some(gl) = self.current_gl("set_stencil_actions") {
            gl.stencil_op(
                stencil_face(face),
                stencil_action(stencil_fail),
                stencil_action(depth_fail),
                stencil_action(pass),
            );
        }
    }

    fn set_stencil_reference_value(&self, value: u32) {
        let Some(gl) = self.current_gl("set_stencil_reference_value") else {
            return;
        };
        let mut stencil = self.stencil.lock();
        stencil.reference = i32::try_from(value).unwrap_or(i32::MAX);
        gl.stencil_func(gl::FRONT, stencil.front, stencil.reference, STENCIL_MASK);
        gl.stencil_func(gl::BACK, stencil.back, stencil.reference, STENCIL_MASK);
    }

    fn set_culling_enabled(&self, enabled: bool) {
        if let Some(gl) = self.current_gl("set_culling_enabled") {
            gl.set_capability(gl::CULL_FACE, enabled);
        }
    }

    fn renderer_name(&self) -> String {
        self.query_string(gl::RENDERER)
    }

    fn renderer_version(&self) -> String {
        self.query_string(gl::VERSION)
    }
}

// ----------------------------------------------------------------------------
// Upload context
// ----------------------------------------------------------------------------

/// Shares objects with the draw context; used by renderers to upload
/// resources from a loader thread.
pub struct UploadContext<G: GlApi, D: TextureDevice> {
    surface: Arc<GlSurface<G, D>>,
}

impl<G: GlApi, D: TextureDevice> UploadContext<G, D> {
    pub(crate) fn new(surface: Arc<GlSurface<G, D>>) -> Self {
        debug!("Upload context created");
        Self { surface }
    }
}

impl<G: GlApi, D: TextureDevice> ContextBinding for UploadContext<G, D> {
    fn make_current(&self) {
        let gl = &self.surface.gl;
        if !gl.make_current(Some(gl.upload_context())) {
            error!("Failed to make upload context current");
        }
    }

    fn done_current(&self) {
        let gl = &self.surface.gl;
        if gl.current_context() == Some(gl.upload_context()) {
            gl.make_current(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessGl;

    #[test]
    fn switch_restores_the_previous_context() {
        let gl = HeadlessGl::new();
        let foreign = gl.create_foreign_context();
        assert!(gl.make_current(Some(foreign)));
        {
            let _switch = ContextSwitch::enter(&gl, gl.draw_context()).expect("switch");
            assert_eq!(gl.current_context(), Some(gl.draw_context()));
        }
        assert_eq!(gl.current_context(), Some(foreign));
        assert!(gl.make_current(None));
    }

    #[test]
    fn switch_releases_when_nothing_was_current() {
        let gl = HeadlessGl::new();
        {
            let _switch = ContextSwitch::enter(&gl, gl.draw_context()).expect("switch");
            assert_eq!(gl.draw_context_owner(), Some(std::thread::current().id()));
        }
        assert_eq!(gl.current_context(), None);
        assert_eq!(gl.draw_context_owner(), None);
    }

    #[test]
    fn switch_to_the_current_context_keeps_it() {
        let gl = HeadlessGl::new();
        assert!(gl.make_current(Some(gl.draw_context())));
        drop(ContextSwitch::enter(&gl, gl.draw_context()).expect("switch"));
        assert_eq!(gl.current_context(), Some(gl.draw_context()));
        assert!(gl.make_current(None));
    }
}
