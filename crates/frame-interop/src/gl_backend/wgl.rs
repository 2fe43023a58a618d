//! WGL contexts on a hidden window.
//!
//! Two contexts are created on the same pixel format and joined with
//! `wglShareLists`, so objects created on the upload context are visible to
//! the draw context. Rendering always targets the offscreen framebuffer; the
//! window only provides a device context.

use std::ffi::{c_void, CStr};
use std::sync::Once;

use anyhow::{bail, Context, Result};
use gl::types::{GLbitfield, GLenum, GLint, GLsizei, GLuint};
use tracing::{debug, info, warn};
use windows::core::w;
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Gdi::{GetDC, ReleaseDC, HDC};
use windows::Win32::Graphics::OpenGL::*;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::*;

use super::{ContextHandle, ContextSwitch, GlApi};
use crate::region::Rect;

static GL_INIT_ONCE: Once = Once::new();
static CLASS_INIT_ONCE: Once = Once::new();

unsafe extern "system" fn window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

/// WGL draw and upload contexts sharing one object namespace.
pub struct WglApi {
    hwnd: HWND,
    hdc: HDC,
    draw: HGLRC,
    upload: HGLRC,
}

// SAFETY: HWND/HDC/HGLRC are process-wide handles. WGL itself enforces that a
// context is current on one thread at a time; GlApi callers go through
// make_current before issuing GL calls.
unsafe impl Send for WglApi {}
unsafe impl Sync for WglApi {}

impl WglApi {
    /// Create the hidden window, both contexts, and load GL entry points.
    ///
    /// Restores whatever context was current on the calling thread.
    pub fn new() -> Result<Self> {
        let hwnd = create_hidden_window()?;
        let hdc = unsafe { GetDC(Some(hwnd)) };
        if hdc.is_invalid() {
            unsafe {
                let _ = DestroyWindow(hwnd);
            }
            bail!("GetDC failed for the hidden GL window");
        }

        let api = match create_contexts(hdc) {
            Ok((draw, upload)) => Self {
                hwnd,
                hdc,
                draw,
                upload,
            },
            Err(e) => {
                unsafe {
                    ReleaseDC(Some(hwnd), hdc);
                    let _ = DestroyWindow(hwnd);
                }
                return Err(e);
            }
        };

        // Entry points resolve through the current context.
        let (fbo_supported, renderer, version) = {
            let _switch = ContextSwitch::enter(&api, api.draw_context())
                .context("draw context could not be made current")?;
            GL_INIT_ONCE.call_once(|| {
                gl_loader::init_gl();
                gl::load_with(|s| gl_loader::get_proc_address(s).cast());
            });
            (
                gl::GenFramebuffers::is_loaded()
                    && gl::CheckFramebufferStatus::is_loaded()
                    && gl::DrawBuffers::is_loaded(),
                api.get_string(gl::RENDERER).unwrap_or_default(),
                api.get_string(gl::VERSION).unwrap_or_default(),
            )
        };

        if !fbo_supported {
            bail!("framebuffer objects not supported by {renderer} ({version})");
        }
        info!("WGL contexts ready: {} ({})", renderer, version);
        Ok(api)
    }

    fn handle(&self, context: HGLRC) -> ContextHandle {
        ContextHandle {
            context: context.0 as usize,
            drawable: self.hdc.0 as usize,
        }
    }
}

impl Drop for WglApi {
    fn drop(&mut self) {
        unsafe {
            let current = wglGetCurrentContext();
            if current == self.draw || current == self.upload {
                let _ = wglMakeCurrent(HDC::default(), HGLRC::default());
            }
            if let Err(e) = wglDeleteContext(self.upload) {
                warn!("wglDeleteContext(upload) failed: {e}");
            }
            if let Err(e) = wglDeleteContext(self.draw) {
                warn!("wglDeleteContext(draw) failed: {e}");
            }
            ReleaseDC(Some(self.hwnd), self.hdc);
            let _ = DestroyWindow(self.hwnd);
        }
        debug!("WGL contexts destroyed");
    }
}

fn create_hidden_window() -> Result<HWND> {
    let instance = unsafe { GetModuleHandleW(None) }.context("GetModuleHandleW")?;
    let class_name = w!("FrameBridgeGLWindow");

    CLASS_INIT_ONCE.call_once(|| {
        let class = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            style: CS_OWNDC,
            lpfnWndProc: Some(window_proc),
            hInstance: instance.into(),
            lpszClassName: class_name,
            ..Default::default()
        };
        if unsafe { RegisterClassExW(&class) } == 0 {
            warn!("RegisterClassExW failed; window creation will report the error");
        }
    });

    let hwnd = unsafe {
        CreateWindowExW(
            WINDOW_EX_STYLE::default(),
            class_name,
            w!("frame-bridge"),
            WS_POPUP,
            0,
            0,
            1,
            1,
            None,
            None,
            Some(instance.into()),
            None,
        )
    }
    .context("CreateWindowExW for hidden GL window")?;
    Ok(hwnd)
}

fn create_contexts(hdc: HDC) -> Result<(HGLRC, HGLRC)> {
    let pfd = PIXELFORMATDESCRIPTOR {
        nSize: std::mem::size_of::<PIXELFORMATDESCRIPTOR>() as u16,
        nVersion: 1,
        dwFlags: PFD_DRAW_TO_WINDOW | PFD_SUPPORT_OPENGL | PFD_DOUBLEBUFFER,
        iPixelType: PFD_TYPE_RGBA,
        cColorBits: 32,
        cDepthBits: 24,
        cStencilBits: 8,
        ..Default::default()
    };

    unsafe {
        let format = ChoosePixelFormat(hdc, &pfd);
        if format == 0 {
            bail!("ChoosePixelFormat found no RGBA8/D24S8 format");
        }
        SetPixelFormat(hdc, format, &pfd).context("SetPixelFormat")?;

        let draw = wglCreateContext(hdc).context("wglCreateContext(draw)")?;
        let upload = match wglCreateContext(hdc) {
            Ok(upload) => upload,
            Err(e) => {
                let _ = wglDeleteContext(draw);
                return Err(e).context("wglCreateContext(upload)");
            }
        };
        if let Err(e) = wglShareLists(draw, upload) {
            let _ = wglDeleteContext(upload);
            let _ = wglDeleteContext(draw);
            return Err(e).context("wglShareLists(draw, upload)");
        }
        debug!("WGL contexts created: draw={:?} upload={:?}", draw.0, upload.0);
        Ok((draw, upload))
    }
}

fn size(v: u32) -> GLsizei {
    GLsizei::try_from(v).unwrap_or(GLsizei::MAX)
}

fn get_integers<const N: usize>(name: GLenum) -> [GLint; N] {
    let mut out = [0; N];
    unsafe { gl::GetIntegerv(name, out.as_mut_ptr()) };
    out
}

// ----------------------------------------------------------------------------
// GlApi
// ----------------------------------------------------------------------------

impl GlApi for WglApi {
    fn draw_context(&self) -> ContextHandle {
        self.handle(self.draw)
    }

    fn upload_context(&self) -> ContextHandle {
        self.handle(self.upload)
    }

    fn current_context(&self) -> Option<ContextHandle> {
        let (context, dc) = unsafe { (wglGetCurrentContext(), wglGetCurrentDC()) };
        ContextHandle::new(context.0 as usize, dc.0 as usize)
    }

    fn make_current(&self, context: Option<ContextHandle>) -> bool {
        let result = unsafe {
            match context {
                Some(c) => wglMakeCurrent(
                    HDC(c.drawable() as *mut c_void),
                    HGLRC(c.context() as *mut c_void),
                ),
                None => wglMakeCurrent(HDC::default(), HGLRC::default()),
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("wglMakeCurrent({:?}) failed: {e}", context);
                false
            }
        }
    }

    fn gen_framebuffer(&self) -> GLuint {
        let mut name = 0;
        unsafe { gl::GenFramebuffers(1, &mut name) };
        name
    }

    fn gen_texture(&self) -> GLuint {
        let mut name = 0;
        unsafe { gl::GenTextures(1, &mut name) };
        name
    }

    fn gen_renderbuffer(&self) -> GLuint {
        let mut name = 0;
        unsafe { gl::GenRenderbuffers(1, &mut name) };
        name
    }

    fn delete_framebuffer(&self, framebuffer: GLuint) {
        if framebuffer != 0 {
            unsafe { gl::DeleteFramebuffers(1, &framebuffer) };
        }
    }

    fn delete_texture(&self, texture: GLuint) {
        if texture != 0 {
            unsafe { gl::DeleteTextures(1, &texture) };
        }
    }

    fn delete_renderbuffer(&self, renderbuffer: GLuint) {
        if renderbuffer != 0 {
            unsafe { gl::DeleteRenderbuffers(1, &renderbuffer) };
        }
    }

    fn color_storage(&self, texture: GLuint, width: u32, height: u32) {
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as GLint);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as GLint);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA8 as GLint,
                size(width),
                size(height),
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                std::ptr::null(),
            );
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
    }

    fn depth_stencil_storage(&self, renderbuffer: GLuint, width: u32, height: u32) {
        unsafe {
            gl::BindRenderbuffer(gl::RENDERBUFFER, renderbuffer);
            gl::RenderbufferStorage(
                gl::RENDERBUFFER,
                gl::DEPTH24_STENCIL8,
                size(width),
                size(height),
            );
            gl::BindRenderbuffer(gl::RENDERBUFFER, 0);
        }
    }

    fn attach(&self, framebuffer: GLuint, color: GLuint, depth_stencil: GLuint) {
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                color,
                0,
            );
            gl::FramebufferRenderbuffer(
                gl::FRAMEBUFFER,
                gl::DEPTH_STENCIL_ATTACHMENT,
                gl::RENDERBUFFER,
                depth_stencil,
            );
        }
    }

    fn declare_draw_buffer(&self, framebuffer: GLuint) {
        let buffers = [gl::COLOR_ATTACHMENT0];
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer);
            gl::DrawBuffers(1, buffers.as_ptr());
        }
    }

    fn framebuffer_status(&self, framebuffer: GLuint) -> GLenum {
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer);
            gl::CheckFramebufferStatus(gl::FRAMEBUFFER)
        }
    }

    fn bind_framebuffer(&self, framebuffer: GLuint) {
        unsafe { gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer) };
    }

    fn framebuffer_binding(&self) -> GLuint {
        get_integers::<1>(gl::FRAMEBUFFER_BINDING)[0] as GLuint
    }

    fn viewport(&self, rect: Rect) {
        unsafe { gl::Viewport(rect.x, rect.y, size(rect.width), size(rect.height)) };
    }

    fn current_viewport(&self) -> Rect {
        Rect::from(get_integers::<4>(gl::VIEWPORT))
    }

    fn scissor(&self, rect: Rect) {
        unsafe { gl::Scissor(rect.x, rect.y, size(rect.width), size(rect.height)) };
    }

    fn current_scissor(&self) -> Rect {
        Rect::from(get_integers::<4>(gl::SCISSOR_BOX))
    }

    fn set_capability(&self, capability: GLenum, enabled: bool) {
        unsafe {
            if enabled {
                gl::Enable(capability);
            } else {
                gl::Disable(capability);
            }
        }
    }

    fn is_enabled(&self, capability: GLenum) -> bool {
        unsafe { gl::IsEnabled(capability) == gl::TRUE }
    }

    fn depth_func(&self, function: GLenum) {
        unsafe { gl::DepthFunc(function) };
    }

    fn stencil_func(&self, face: GLenum, function: GLenum, reference: i32, mask: u32) {
        unsafe { gl::StencilFuncSeparate(face, function, reference, mask) };
    }

    fn stencil_op(&self, face: GLenum, stencil_fail: GLenum, depth_fail: GLenum, pass: GLenum) {
        unsafe { gl::StencilOpSeparate(face, stencil_fail, depth_fail, pass) };
    }

    fn clear_color(&self, rgba: [f32; 4]) {
        unsafe { gl::ClearColor(rgba[0], rgba[1], rgba[2], rgba[3]) };
    }

    fn clear(&self, mask: GLbitfield) {
        unsafe { gl::Clear(mask) };
    }

    fn flush(&self) {
        unsafe { gl::Flush() };
    }

    fn finish(&self) {
        unsafe { gl::Finish() };
    }

    fn read_pixels(&self, region: Rect, out: &mut [u8]) {
        if out.len() < region.byte_len() {
            warn!(
                "Readback buffer too small: {} < {}",
                out.len(),
                region.byte_len()
            );
            return;
        }
        unsafe {
            gl::PixelStorei(gl::PACK_ALIGNMENT, 4);
            gl::ReadPixels(
                region.x,
                region.y,
                size(region.width),
                size(region.height),
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                out.as_mut_ptr().cast(),
            );
        }
    }

    fn get_string(&self, name: GLenum) -> Option<String> {
        let ptr = unsafe { gl::GetString(name) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: glGetString returns a static NUL-terminated string.
        let s = unsafe { CStr::from_ptr(ptr.cast()) };
        Some(s.to_string_lossy().into_owned())
    }
}
