//! The offscreen GL render target renderers draw into.

use anyhow::{bail, Result};
use gl::types::GLuint;
use tracing::{debug, error};

use crate::gl_backend::{is_complete, status_name, GlApi};
use crate::region::Rect;

/// Framebuffer with an RGBA8 color texture and a depth-stencil renderbuffer.
///
/// All methods require the draw context to be current on the calling thread.
/// The framebuffer name is stable for the target's lifetime; attachments are
/// replaced on resize.
#[derive(Debug)]
pub struct RenderTarget {
    framebuffer: GLuint,
    color: GLuint,
    depth_stencil: GLuint,
    width: u32,
    height: u32,
}

impl RenderTarget {
    pub fn create<G: GlApi + ?Sized>(gl: &G, width: u32, height: u32) -> Result<Self> {
        let framebuffer = gl.gen_framebuffer();
        let (color, depth_stencil) = match build_attachments(gl, framebuffer, width, height) {
            Ok(attachments) => attachments,
            Err(e) => {
                gl.bind_framebuffer(0);
                gl.delete_framebuffer(framebuffer);
                return Err(e);
            }
        };

        debug!(
            "Render target created: fbo={} color={} depth_stencil={} ({}x{})",
            framebuffer, color, depth_stencil, width, height
        );
        reset_view(gl, width, height);

        Ok(Self {
            framebuffer,
            color,
            depth_stencil,
            width,
            height,
        })
    }

    /// Replace both attachments with new ones at `width` x `height`.
    ///
    /// On failure the previous attachments are re-attached and the target
    /// keeps its previous size.
    pub fn reallocate<G: GlApi + ?Sized>(&mut self, gl: &G, width: u32, height: u32) -> Result<()> {
        match build_attachments(gl, self.framebuffer, width, height) {
            Ok((color, depth_stencil)) => {
                gl.delete_texture(self.color);
                gl.delete_renderbuffer(self.depth_stencil);
                self.color = color;
                self.depth_stencil = depth_stencil;
                self.width = width;
                self.height = height;
                reset_view(gl, width, height);
                Ok(())
            }
            Err(e) => {
                gl.attach(self.framebuffer, self.color, self.depth_stencil);
                gl.declare_draw_buffer(self.framebuffer);
                Err(e)
            }
        }
    }

    pub fn destroy<G: GlApi + ?Sized>(&mut self, gl: &G) {
        if gl.framebuffer_binding() == self.framebuffer {
            gl.bind_framebuffer(0);
        }
        gl.delete_texture(self.color);
        gl.delete_renderbuffer(self.depth_stencil);
        gl.delete_framebuffer(self.framebuffer);
        self.color = 0;
        self.depth_stencil = 0;
        self.framebuffer = 0;
    }

    pub fn framebuffer(&self) -> GLuint {
        self.framebuffer
    }

    pub fn color_texture(&self) -> GLuint {
        self.color
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Allocate, attach and verify a color + depth-stencil pair on `framebuffer`.
/// Nothing is leaked on failure.
fn build_attachments<G: GlApi + ?Sized>(
    gl: &G,
    framebuffer: GLuint,
    width: u32,
    height: u32,
) -> Result<(GLuint, GLuint)> {
    if width == 0 || height == 0 {
        bail!("render target size must be non-zero, got {width}x{height}");
    }

    let color = gl.gen_texture();
    gl.color_storage(color, width, height);
    let depth_stencil = gl.gen_renderbuffer();
    gl.depth_stencil_storage(depth_stencil, width, height);

    gl.attach(framebuffer, color, depth_stencil);
    // Changing attachments invalidates the draw buffer declaration.
    gl.declare_draw_buffer(framebuffer);

    let status = gl.framebuffer_status(framebuffer);
    if !is_complete(status) {
        error!(
            "Framebuffer {} incomplete at {}x{}: {} (0x{:X})",
            framebuffer,
            width,
            height,
            status_name(status),
            status
        );
        gl.delete_texture(color);
        gl.delete_renderbuffer(depth_stencil);
        bail!("framebuffer incomplete: {}", status_name(status));
    }
    Ok((color, depth_stencil))
}

fn reset_view<G: GlApi + ?Sized>(gl: &G, width: u32, height: u32) {
    let full = Rect::full(width, height);
    gl.viewport(full);
    gl.scissor(full);
}
