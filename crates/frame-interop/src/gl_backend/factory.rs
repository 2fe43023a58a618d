//! GL surface factory: offscreen render target, readback into the shared
//! texture, frame notification.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gl::types::GLuint;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::context::{ContextSwitch, DrawContext, UploadContext};
use super::GlApi;
use crate::bridge::{ContextBinding, DrawSurface, ResizeOutcome, SurfaceDescriptor, SurfaceFactory};
use crate::config::BridgeConfig;
use crate::notify::{FrameNotifier, PresentSignal};
use crate::shared_texture::{SharedTextureManager, TexturePublisher};
use crate::target::RenderTarget;
use crate::texture::{RawPtr, TextureDevice};
use crate::throttle::LogThrottle;
use crate::transfer::{self, FrameLayout, TransferDescriptor};

/// State touched only while holding the frame lock.
struct FrameState<D: TextureDevice> {
    target: Option<RenderTarget>,
    textures: SharedTextureManager<D>,
    /// Readback buffer, reused across frames.
    pixels: Vec<u8>,
    frames: u64,
    size: (u32, u32),
}

/// Everything the factory and its contexts share.
///
/// Lock order: `frame` before `pending_size`. The publisher and notifier
/// never call back into the surface.
pub(crate) struct GlSurface<G: GlApi, D: TextureDevice> {
    pub(crate) gl: G,
    frame: Mutex<FrameState<D>>,
    publisher: Arc<TexturePublisher<D>>,
    pub(crate) notifier: FrameNotifier,
    /// Framebuffer the renderer last bound; the readback source.
    last_framebuffer: AtomicU32,
    offscreen: AtomicU32,
    /// Latest resize requested while the draw context was busy elsewhere.
    pending_size: Mutex<Option<(u32, u32)>>,
    config: BridgeConfig,
    transfer_failures: LogThrottle,
    valid: AtomicBool,
}

impl<G: GlApi, D: TextureDevice> GlSurface<G, D> {
    fn initialize(&self, width: u32, height: u32) -> Result<()> {
        let mut frame = self.frame.lock();
        {
            let _switch = ContextSwitch::enter(&self.gl, self.gl.draw_context())
                .context("draw context could not be made current")?;
            let target = RenderTarget::create(&self.gl, width, height)?;
            self.offscreen.store(target.framebuffer(), Ordering::Release);
            self.last_framebuffer
                .store(target.framebuffer(), Ordering::Release);
            frame.target = Some(target);
        }
        frame.textures.create_shared_texture(width, height)?;
        frame.size = (width, height);
        self.valid.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn bind_offscreen(&self) {
        self.bind_framebuffer(self.offscreen.load(Ordering::Acquire));
    }

    /// Bind on the current context and remember it as the readback source.
    pub(crate) fn bind_framebuffer(&self, framebuffer: GLuint) {
        self.gl.bind_framebuffer(framebuffer);
        self.last_framebuffer.store(framebuffer, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------------

    pub(crate) fn resize(&self, width: u32, height: u32) -> ResizeOutcome {
        if width == 0 || height == 0 {
            warn!("Ignoring resize to {}x{}", width, height);
            return ResizeOutcome::Failed;
        }

        let mut guard = self.frame.lock();
        let frame = &mut *guard;
        if frame.size == (width, height) && frame.textures.is_valid() {
            self.pending_size.lock().take();
            return ResizeOutcome::Unchanged;
        }
        let Some(target) = frame.target.as_mut() else {
            error!("Resize requested on a surface that failed to initialize");
            return ResizeOutcome::Failed;
        };

        let previous = frame.size;
        {
            let Some(_switch) = ContextSwitch::enter(&self.gl, self.gl.draw_context()) else {
                debug!(
                    "Draw context busy on another thread; deferring resize to {}x{}",
                    width, height
                );
                *self.pending_size.lock() = Some((width, height));
                return ResizeOutcome::Deferred;
            };
            let reallocated = target.reallocate(&self.gl, width, height);
            self.restore_binding();
            if let Err(e) = reallocated {
                error!("Render target resize to {}x{} failed: {:#}", width, height, e);
                return ResizeOutcome::Failed;
            }
        }
        self.pending_size.lock().take();

        if let Err(e) = frame.textures.create_shared_texture(width, height) {
            error!("Shared texture resize to {}x{} failed: {:#}", width, height, e);
            self.roll_back(frame, previous);
            return ResizeOutcome::Failed;
        }
        frame.size = (width, height);
        info!(
            "Surface resized {}x{} -> {}x{}",
            previous.0, previous.1, width, height
        );
        ResizeOutcome::Resized
    }

    /// Return render target and shared texture to `size` after a failed
    /// resize.
    fn roll_back(&self, frame: &mut FrameState<D>, size: (u32, u32)) {
        let (width, height) = size;
        if let Some(target) = frame.target.as_mut() {
            if let Some(_switch) = ContextSwitch::enter(&self.gl, self.gl.draw_context()) {
                if let Err(e) = target.reallocate(&self.gl, width, height) {
                    warn!("Render target roll back to {}x{} failed: {:#}", width, height, e);
                }
                self.restore_binding();
            }
        }
        match frame.textures.create_shared_texture(width, height) {
            Ok(()) => warn!("Surface kept at {}x{}", width, height),
            Err(e) => error!("Surface has no shared texture: {:#}", e),
        }
    }

    /// Reallocation leaves the offscreen framebuffer bound; put back the one
    /// the renderer last bound so its next draws land where present reads.
    fn restore_binding(&self) {
        self.gl
            .bind_framebuffer(self.last_framebuffer.load(Ordering::Acquire));
    }

    pub(crate) fn apply_pending_resize(&self) -> Option<ResizeOutcome> {
        let (width, height) = self.pending_size.lock().take()?;
        let outcome = self.resize(width, height);
        debug!(?outcome, "Applied deferred resize to {}x{}", width, height);
        Some(outcome)
    }

    // ------------------------------------------------------------------------
    // Present
    // ------------------------------------------------------------------------

    /// Publish the finished frame, then apply a resize queued while it was
    /// being drawn. The frame is carried into the resized texture so the
    /// compositor never sees the new generation empty.
    pub(crate) fn present(&self) -> PresentSignal {
        let transferred = match self.transfer() {
            Ok(descriptor) => Some(FrameLayout::gl(descriptor.source)),
            Err(e) => {
                if self.transfer_failures.should_log() {
                    warn!(
                        failures = self.transfer_failures.count(),
                        "Frame dropped: {:#}", e
                    );
                }
                None
            }
        };

        if self.apply_pending_resize() == Some(ResizeOutcome::Resized) {
            if let Some(layout) = &transferred {
                if let Err(e) = self.republish(layout) {
                    warn!("Frame not carried into the resized texture: {:#}", e);
                }
            }
        }
        self.notifier.on_present(transferred.is_some())
    }

    /// Upload the last readback again, into the current generation.
    fn republish(&self, layout: &FrameLayout) -> Result<TransferDescriptor> {
        let frame = self.frame.lock();
        frame.textures.upload(&frame.pixels, layout)
    }

    /// Read back the last-bound framebuffer and write it into the shared
    /// texture.
    fn transfer(&self) -> Result<TransferDescriptor> {
        let mut guard = self.frame.lock();
        let frame = &mut *guard;
        let target_size = frame
            .textures
            .current()
            .map(|g| g.dimensions())
            .context("no shared texture")?;

        let layout = {
            let _switch = ContextSwitch::enter(&self.gl, self.gl.draw_context())
                .context("draw context is current on another thread")?;
            self.gl
                .bind_framebuffer(self.last_framebuffer.load(Ordering::Acquire));

            let viewport = self.gl.current_viewport();
            let region = transfer::read_region(viewport, target_size);
            if region.is_empty() {
                bail!(
                    "viewport {:?} does not overlap the {}x{} surface",
                    viewport,
                    target_size.0,
                    target_size.1
                );
            }

            self.gl.finish();
            frame.pixels.resize(region.byte_len(), 0);
            self.gl.read_pixels(region, &mut frame.pixels);
            FrameLayout::gl(region)
        };

        let descriptor = frame.textures.upload(&frame.pixels, &layout)?;
        frame.frames += 1;
        if frame.frames % u64::from(self.config.log_every_n_frames.max(1)) == 0 {
            debug!(
                frame = frame.frames,
                region = ?descriptor.source,
                target = ?descriptor.target,
                row_pitch = descriptor.row_pitch,
                has_content = transfer::has_content(&frame.pixels),
                "Frame transferred"
            );
        }
        Ok(descriptor)
    }
}

impl<G: GlApi, D: TextureDevice> Drop for GlSurface<G, D> {
    fn drop(&mut self) {
        self.notifier.disable();
        let frame = self.frame.get_mut();
        if let Some(mut target) = frame.target.take() {
            match ContextSwitch::enter(&self.gl, self.gl.draw_context()) {
                Some(_switch) => target.destroy(&self.gl),
                None => warn!("Draw context busy on another thread; GL objects not deleted"),
            }
        }
        frame.textures.release();
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

/// Surface factory for GL renderers.
///
/// Owns the offscreen render target (bound on the draw context), the shared
/// texture and the notifier. Draw and upload contexts are created on first
/// access and live as long as the factory.
pub struct GlSurfaceFactory<G: GlApi, D: TextureDevice> {
    surface: Arc<GlSurface<G, D>>,
    draw: OnceCell<DrawContext<G, D>>,
    upload: OnceCell<UploadContext<G, D>>,
}

impl<G: GlApi, D: TextureDevice> GlSurfaceFactory<G, D> {
    /// Build the render target and shared texture at `width` x `height`.
    ///
    /// Construction never fails outright: check [`SurfaceFactory::is_valid`].
    pub fn new(gl: G, device: D, width: u32, height: u32, config: BridgeConfig) -> Self {
        let textures = SharedTextureManager::new(device);
        let publisher = textures.publisher().clone();
        let surface = Arc::new(GlSurface {
            gl,
            frame: Mutex::new(FrameState {
                target: None,
                textures,
                pixels: Vec::new(),
                frames: 0,
                size: (0, 0),
            }),
            publisher,
            notifier: FrameNotifier::new(&config),
            last_framebuffer: AtomicU32::new(0),
            offscreen: AtomicU32::new(0),
            pending_size: Mutex::new(None),
            transfer_failures: LogThrottle::new(config.log_every_n_frames),
            config,
            valid: AtomicBool::new(false),
        });

        match surface.initialize(width, height) {
            Ok(()) => info!("GL surface ready ({}x{})", width, height),
            Err(e) => error!("GL surface initialization failed: {:#}", e),
        }

        Self {
            surface,
            draw: OnceCell::new(),
            upload: OnceCell::new(),
        }
    }

    pub fn gl(&self) -> &G {
        &self.surface.gl
    }

    pub fn device(&self) -> &D {
        self.surface.publisher.device()
    }

    pub fn publisher(&self) -> &Arc<TexturePublisher<D>> {
        &self.surface.publisher
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.surface.config
    }

    /// Name of the offscreen framebuffer object.
    pub fn offscreen_framebuffer(&self) -> GLuint {
        self.surface.offscreen.load(Ordering::Acquire)
    }

    /// Transfer the current frame and notify. Same as
    /// [`DrawSurface::present`], with the outcome reported.
    pub fn present(&self) -> PresentSignal {
        self.surface.present()
    }

    /// Frames successfully written into the shared texture.
    pub fn frames_transferred(&self) -> u64 {
        self.surface.frame.lock().frames
    }

    /// Size requested while the draw context was busy, not yet applied.
    pub fn pending_size(&self) -> Option<(u32, u32)> {
        *self.surface.pending_size.lock()
    }
}

impl<G: GlApi, D: TextureDevice> SurfaceFactory for GlSurfaceFactory<G, D> {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn is_valid(&self) -> bool {
        self.surface.valid.load(Ordering::Acquire) && self.surface.publisher.is_valid()
    }

    fn draw_context(&self) -> &dyn DrawSurface {
        self.draw
            .get_or_init(|| DrawContext::new(self.surface.clone()))
    }

    fn upload_context(&self) -> &dyn ContextBinding {
        self.upload
            .get_or_init(|| UploadContext::new(self.surface.clone()))
    }

    fn is_draw_context_created(&self) -> bool {
        self.draw.get().is_some()
    }

    fn is_upload_context_created(&self) -> bool {
        self.upload.get().is_some()
    }

    fn set_surface_size(&self, width: u32, height: u32) -> ResizeOutcome {
        self.surface.resize(width, height)
    }

    fn dimensions(&self) -> (u32, u32) {
        self.surface.publisher.dimensions().unwrap_or((0, 0))
    }

    fn notifier(&self) -> &FrameNotifier {
        &self.surface.notifier
    }

    fn shared_texture_handle(&self) -> RawPtr {
        self.surface.publisher.shared_handle()
    }

    fn d3d11_device(&self) -> RawPtr {
        self.surface.publisher.device_ptr()
    }

    fn d3d11_texture(&self) -> RawPtr {
        self.surface.publisher.texture_ptr()
    }

    fn sample(&self, requested_width: u32, requested_height: u32) -> Option<SurfaceDescriptor> {
        self.surface
            .publisher
            .describe(requested_width, requested_height)
    }
}
