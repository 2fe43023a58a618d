//! Software GL: enough state to drive the bridge without a GPU.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use gl::types::{GLbitfield, GLenum, GLuint};
use parking_lot::Mutex;
use tracing::debug;

use crate::gl_backend::{ContextHandle, GlApi};
use crate::region::Rect;

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);

/// RGBA8 image, bottom row first.
#[derive(Debug, Default)]
struct Image {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Image {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    fn fill(&mut self, region: Rect, rgba: [u8; 4]) {
        let region = region.clamp_to(self.width, self.height);
        for y in region.y as usize..region.y as usize + region.height as usize {
            let row = y * self.width as usize * 4;
            for x in region.x as usize..region.x as usize + region.width as usize {
                self.pixels[row + x * 4..row + x * 4 + 4].copy_from_slice(&rgba);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Framebuffer {
    color: GLuint,
    depth_stencil: GLuint,
    draw_buffer_declared: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StencilFaceState {
    function: GLenum,
    reference: i32,
    mask: u32,
    ops: [GLenum; 3],
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            function: gl::ALWAYS,
            reference: 0,
            mask: u32::MAX,
            ops: [gl::KEEP; 3],
        }
    }
}

#[derive(Debug)]
struct ContextState {
    framebuffer: GLuint,
    viewport: Rect,
    scissor: Rect,
    capabilities: HashSet<GLenum>,
    clear_color: [f32; 4],
    depth_function: GLenum,
    stencil_front: StencilFaceState,
    stencil_back: StencilFaceState,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            framebuffer: 0,
            viewport: Rect::full(1, 1),
            scissor: Rect::full(1, 1),
            capabilities: HashSet::new(),
            clear_color: [0.0; 4],
            depth_function: gl::LESS,
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
        }
    }
}

impl ContextState {
    fn stencil_faces(&mut self, face: GLenum) -> Vec<&mut StencilFaceState> {
        match face {
            gl::FRONT => vec![&mut self.stencil_front],
            gl::BACK => vec![&mut self.stencil_back],
            _ => vec![&mut self.stencil_front, &mut self.stencil_back],
        }
    }
}

/// Objects shared between the draw and upload contexts.
#[derive(Debug, Default)]
struct Objects {
    next_name: GLuint,
    textures: HashMap<GLuint, Image>,
    renderbuffers: HashMap<GLuint, (u32, u32)>,
    framebuffers: HashMap<GLuint, Framebuffer>,
}

impl Objects {
    fn gen(&mut self) -> GLuint {
        self.next_name += 1;
        self.next_name
    }
}

#[derive(Debug, Default)]
struct SoftGl {
    bindings: HashMap<ThreadId, ContextHandle>,
    owners: HashMap<ContextHandle, ThreadId>,
    contexts: HashMap<ContextHandle, ContextState>,
    objects: Objects,
}

/// In-memory GL implementation.
///
/// Contexts follow GL's threading rule: a context is current on at most one
/// thread, and binding it elsewhere fails until it is released.
pub struct HeadlessGl {
    draw: ContextHandle,
    upload: ContextHandle,
    state: Mutex<SoftGl>,
    incomplete_framebuffers: AtomicBool,
    make_current_calls: AtomicU64,
    finish_calls: AtomicU64,
}

impl Default for HeadlessGl {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessGl {
    pub fn new() -> Self {
        let mut state = SoftGl::default();
        let draw = new_context_handle();
        let upload = new_context_handle();
        state.contexts.insert(draw, ContextState::default());
        state.contexts.insert(upload, ContextState::default());
        debug!("Headless GL contexts: draw={:?} upload={:?}", draw, upload);

        Self {
            draw,
            upload,
            state: Mutex::new(state),
            incomplete_framebuffers: AtomicBool::new(false),
            make_current_calls: AtomicU64::new(0),
            finish_calls: AtomicU64::new(0),
        }
    }

    /// Create an unrelated context, standing in for one the host application
    /// owns.
    pub fn create_foreign_context(&self) -> ContextHandle {
        let handle = new_context_handle();
        self.state
            .lock()
            .contexts
            .insert(handle, ContextState::default());
        handle
    }

    /// Make every subsequent completeness check fail.
    pub fn set_incomplete_framebuffers(&self, incomplete: bool) {
        self.incomplete_framebuffers
            .store(incomplete, Ordering::Release);
    }

    /// Fill `rect` of the bound framebuffer's color attachment, honouring
    /// viewport and (when enabled) scissor. Returns whether any pixel was
    /// written.
    pub fn paint(&self, rect: Rect, rgba: [u8; 4]) -> bool {
        self.with_current(|ctx, objects| {
            let Some(image) = color_image(ctx, objects) else {
                return false;
            };
            let mut region = intersect(rect, ctx.viewport);
            if ctx.capabilities.contains(&gl::SCISSOR_TEST) {
                region = intersect(region, ctx.scissor);
            }
            let region = region.clamp_to(image.width, image.height);
            image.fill(region, rgba);
            !region.is_empty()
        })
        .unwrap_or(false)
    }

    /// Thread the draw context is current on, if any.
    pub fn draw_context_owner(&self) -> Option<ThreadId> {
        self.state.lock().owners.get(&self.draw).copied()
    }

    pub fn make_current_calls(&self) -> u64 {
        self.make_current_calls.load(Ordering::Relaxed)
    }

    pub fn finish_calls(&self) -> u64 {
        self.finish_calls.load(Ordering::Relaxed)
    }

    /// Live textures, renderbuffers and framebuffers.
    pub fn live_objects(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.objects.textures.len(),
            state.objects.renderbuffers.len(),
            state.objects.framebuffers.len(),
        )
    }

    pub fn depth_function(&self) -> Option<GLenum> {
        self.with_current(|ctx, _| ctx.depth_function)
    }

    /// `(function, reference, mask)` for `GL_FRONT` or `GL_BACK`.
    pub fn stencil_function(&self, face: GLenum) -> Option<(GLenum, i32, u32)> {
        self.with_current(|ctx, _| {
            let s = if face == gl::BACK {
                ctx.stencil_back
            } else {
                ctx.stencil_front
            };
            (s.function, s.reference, s.mask)
        })
    }

    /// `[stencil_fail, depth_fail, pass]` for `GL_FRONT` or `GL_BACK`.
    pub fn stencil_actions(&self, face: GLenum) -> Option<[GLenum; 3]> {
        self.with_current(|ctx, _| {
            if face == gl::BACK {
                ctx.stencil_back.ops
            } else {
                ctx.stencil_front.ops
            }
        })
    }

    pub fn clear_color_value(&self) -> Option<[f32; 4]> {
        self.with_current(|ctx, _| ctx.clear_color)
    }

    fn with_current<R>(&self, f: impl FnOnce(&mut ContextState, &mut Objects) -> R) -> Option<R> {
        let mut guard = self.state.lock();
        let soft = &mut *guard;
        let handle = *soft.bindings.get(&thread::current().id())?;
        let ctx = soft.contexts.get_mut(&handle)?;
        Some(f(ctx, &mut soft.objects))
    }

    fn status_of(&self, objects: &Objects, framebuffer: GLuint) -> GLenum {
        if self.incomplete_framebuffers.load(Ordering::Acquire) {
            return gl::FRAMEBUFFER_UNSUPPORTED;
        }
        if framebuffer == 0 {
            return gl::FRAMEBUFFER_COMPLETE;
        }
        let Some(fb) = objects.framebuffers.get(&framebuffer) else {
            return gl::FRAMEBUFFER_UNDEFINED;
        };
        let Some(color) = objects.textures.get(&fb.color).filter(|i| i.width > 0) else {
            return gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT;
        };
        match objects.renderbuffers.get(&fb.depth_stencil) {
            Some(&(w, h)) if (w, h) == (color.width, color.height) => {}
            _ => return gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT,
        }
        if !fb.draw_buffer_declared {
            return gl::FRAMEBUFFER_INCOMPLETE_DRAW_BUFFER;
        }
        gl::FRAMEBUFFER_COMPLETE
    }
}

fn new_context_handle() -> ContextHandle {
    ContextHandle::software(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
}

fn color_image<'a>(ctx: &ContextState, objects: &'a mut Objects) -> Option<&'a mut Image> {
    let fb = objects.framebuffers.get(&ctx.framebuffer)?;
    let color = fb.color;
    objects.textures.get_mut(&color)
}

fn intersect(a: Rect, b: Rect) -> Rect {
    let x0 = a.x.max(b.x);
    let y0 = a.y.max(b.y);
    let x1 = (a.x as i64 + a.width as i64).min(b.x as i64 + b.width as i64);
    let y1 = (a.y as i64 + a.height as i64).min(b.y as i64 + b.height as i64);
    Rect::new(
        x0,
        y0,
        (x1 - x0 as i64).max(0) as u32,
        (y1 - y0 as i64).max(0) as u32,
    )
}

fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

impl GlApi for HeadlessGl {
    fn draw_context(&self) -> ContextHandle {
        self.draw
    }

    fn upload_context(&self) -> ContextHandle {
        self.upload
    }

    fn current_context(&self) -> Option<ContextHandle> {
        self.state
            .lock()
            .bindings
            .get(&thread::current().id())
            .copied()
    }

    fn make_current(&self, context: Option<ContextHandle>) -> bool {
        self.make_current_calls.fetch_add(1, Ordering::Relaxed);
        let me = thread::current().id();
        let mut state = self.state.lock();

        if let Some(handle) = context {
            if !state.contexts.contains_key(&handle) {
                return false;
            }
            if let Some(&owner) = state.owners.get(&handle) {
                if owner != me {
                    return false;
                }
            }
        }

        if let Some(previous) = state.bindings.remove(&me) {
            state.owners.remove(&previous);
        }
        if let Some(handle) = context {
            state.bindings.insert(me, handle);
            state.owners.insert(handle, me);
        }
        true
    }

    fn gen_framebuffer(&self) -> GLuint {
        let mut state = self.state.lock();
        let name = state.objects.gen();
        state.objects.framebuffers.insert(name, Framebuffer::default());
        name
    }

    fn gen_texture(&self) -> GLuint {
        let mut state = self.state.lock();
        let name = state.objects.gen();
        state.objects.textures.insert(name, Image::default());
        name
    }

    fn gen_renderbuffer(&self) -> GLuint {
        let mut state = self.state.lock();
        let name = state.objects.gen();
        state.objects.renderbuffers.insert(name, (0, 0));
        name
    }

    fn delete_framebuffer(&self, framebuffer: GLuint) {
        let mut state = self.state.lock();
        state.objects.framebuffers.remove(&framebuffer);
        for ctx in state.contexts.values_mut() {
            if ctx.framebuffer == framebuffer {
                ctx.framebuffer = 0;
            }
        }
    }

    fn delete_texture(&self, texture: GLuint) {
        self.state.lock().objects.textures.remove(&texture);
    }

    fn delete_renderbuffer(&self, renderbuffer: GLuint) {
        self.state.lock().objects.renderbuffers.remove(&renderbuffer);
    }

    fn color_storage(&self, texture: GLuint, width: u32, height: u32) {
        if let Some(image) = self.state.lock().objects.textures.get_mut(&texture) {
            *image = Image::new(width, height);
        }
    }

    fn depth_stencil_storage(&self, renderbuffer: GLuint, width: u32, height: u32) {
        if let Some(size) = self.state.lock().objects.renderbuffers.get_mut(&renderbuffer) {
            *size = (width, height);
        }
    }

    fn attach(&self, framebuffer: GLuint, color: GLuint, depth_stencil: GLuint) {
        self.with_current(|ctx, objects| {
            ctx.framebuffer = framebuffer;
            if let Some(fb) = objects.framebuffers.get_mut(&framebuffer) {
                fb.color = color;
                fb.depth_stencil = depth_stencil;
                fb.draw_buffer_declared = false;
            }
        });
    }

    fn declare_draw_buffer(&self, framebuffer: GLuint) {
        self.with_current(|ctx, objects| {
            ctx.framebuffer = framebuffer;
            if let Some(fb) = objects.framebuffers.get_mut(&framebuffer) {
                fb.draw_buffer_declared = true;
            }
        });
    }

    fn framebuffer_status(&self, framebuffer: GLuint) -> GLenum {
        let mut guard = self.state.lock();
        let soft = &mut *guard;
        let Some(handle) = soft.bindings.get(&thread::current().id()).copied() else {
            return 0;
        };
        if let Some(ctx) = soft.contexts.get_mut(&handle) {
            ctx.framebuffer = framebuffer;
        }
        self.status_of(&soft.objects, framebuffer)
    }

    fn bind_framebuffer(&self, framebuffer: GLuint) {
        self.with_current(|ctx, _| ctx.framebuffer = framebuffer);
    }

    fn framebuffer_binding(&self) -> GLuint {
        self.with_current(|ctx, _| ctx.framebuffer).unwrap_or(0)
    }

    fn viewport(&self, rect: Rect) {
        self.with_current(|ctx, _| ctx.viewport = rect);
    }

    fn current_viewport(&self) -> Rect {
        self.with_current(|ctx, _| ctx.viewport).unwrap_or_default()
    }

    fn scissor(&self, rect: Rect) {
        self.with_current(|ctx, _| ctx.scissor = rect);
    }

    fn current_scissor(&self) -> Rect {
        self.with_current(|ctx, _| ctx.scissor).unwrap_or_default()
    }

    fn set_capability(&self, capability: GLenum, enabled: bool) {
        self.with_current(|ctx, _| {
            if enabled {
                ctx.capabilities.insert(capability);
            } else {
                ctx.capabilities.remove(&capability);
            }
        });
    }

    fn is_enabled(&self, capability: GLenum) -> bool {
        self.with_current(|ctx, _| ctx.capabilities.contains(&capability))
            .unwrap_or(false)
    }

    fn depth_func(&self, function: GLenum) {
        self.with_current(|ctx, _| ctx.depth_function = function);
    }

    fn stencil_func(&self, face: GLenum, function: GLenum, reference: i32, mask: u32) {
        self.with_current(|ctx, _| {
            for s in ctx.stencil_faces(face) {
                s.function = function;
                s.reference = reference;
                s.mask = mask;
            }
        });
    }

    fn stencil_op(&self, face: GLenum, stencil_fail: GLenum, depth_fail: GLenum, pass: GLenum) {
        self.with_current(|ctx, _| {
            for s in ctx.stencil_faces(face) {
                s.ops = [stencil_fail, depth_fail, pass];
            }
        });
    }

    fn clear_color(&self, rgba: [f32; 4]) {
        self.with_current(|ctx, _| ctx.clear_color = rgba);
    }

    fn clear(&self, mask: GLbitfield) {
        if mask & gl::COLOR_BUFFER_BIT == 0 {
            return;
        }
        self.with_current(|ctx, objects| {
            let rgba = ctx.clear_color.map(to_unorm8);
            let scissored = ctx.capabilities.contains(&gl::SCISSOR_TEST);
            let scissor = ctx.scissor;
            if let Some(image) = color_image(ctx, objects) {
                let region = if scissored {
                    scissor
                } else {
                    Rect::full(image.width, image.height)
                };
                image.fill(region, rgba);
            }
        });
    }

    fn flush(&self) {}

    fn finish(&self) {
        self.finish_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn read_pixels(&self, region: Rect, out: &mut [u8]) {
        self.with_current(|ctx, objects| {
            let image = color_image(ctx, objects);
            let w = region.width as usize;
            for row in 0..region.height as usize {
                for col in 0..w {
                    let dst = (row * w + col) * 4;
                    if dst + 4 > out.len() {
                        return;
                    }
                    let x = region.x as i64 + col as i64;
                    let y = region.y as i64 + row as i64;
                    let px = match image.as_deref() {
                        Some(img)
                            if x >= 0
                                && y >= 0
                                && (x as u32) < img.width
                                && (y as u32) < img.height =>
                        {
                            let src = (y as usize * img.width as usize + x as usize) * 4;
                            [
                                img.pixels[src],
                                img.pixels[src + 1],
                                img.pixels[src + 2],
                                img.pixels[src + 3],
                            ]
                        }
                        _ => [0; 4],
                    };
                    out[dst..dst + 4].copy_from_slice(&px);
                }
            }
        });
    }

    fn get_string(&self, name: GLenum) -> Option<String> {
        match name {
            gl::VENDOR => Some("frame-interop".to_string()),
            gl::RENDERER => Some("Headless GL".to_string()),
            gl::VERSION => Some("3.3 (headless)".to_string()),
            _ => None,
        }
    }
}
