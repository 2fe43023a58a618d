//! Vulkan surface factory: offscreen images, CPU-mediated transfer into the
//! shared texture, frame notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::context::{VulkanDrawContext, VulkanUploadContext};
use super::device::VulkanDevice;
use super::target::VulkanTarget;
use crate::bridge::{
    ClearBits, ContextBinding, DrawSurface, ResizeOutcome, StencilAction, SurfaceDescriptor,
    SurfaceFactory, TestFunction,
};
use crate::config::BridgeConfig;
use crate::notify::{FrameNotifier, PresentSignal};
use crate::region::Rect;
use crate::shared_texture::{SharedTextureManager, TexturePublisher};
use crate::texture::{RawPtr, TextureDevice};
use crate::throttle::LogThrottle;
use crate::transfer::{self, FrameLayout, TransferDescriptor};

/// Stencil test configuration for one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilFaceState {
    pub function: TestFunction,
    pub stencil_fail: StencilAction,
    pub depth_fail: StencilAction,
    pub pass: StencilAction,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            function: TestFunction::Always,
            stencil_fail: StencilAction::Keep,
            depth_fail: StencilAction::Keep,
            pass: StencilAction::Keep,
        }
    }
}

/// Fixed-function state set through the draw context.
///
/// Vulkan bakes most of this into pipelines, so the surface only records it;
/// renderers read it back with [`VulkanSurfaceFactory::draw_state`] when
/// building pipelines or setting dynamic state. The viewport also selects the
/// region read back on present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawState {
    pub viewport: Rect,
    pub scissor: Rect,
    pub clear_color: [f32; 4],
    pub depth_test: bool,
    pub depth_function: TestFunction,
    pub stencil_test: bool,
    pub stencil_front: StencilFaceState,
    pub stencil_back: StencilFaceState,
    pub stencil_reference: u32,
    pub culling: bool,
}

impl DrawState {
    fn new(width: u32, height: u32) -> Self {
        Self {
            viewport: Rect::full(width, height),
            scissor: Rect::full(width, height),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth_test: false,
            depth_function: TestFunction::Less,
            stencil_test: false,
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
            stencil_reference: 0,
            culling: false,
        }
    }

    fn reset_view(&mut self, width: u32, height: u32) {
        self.viewport = Rect::full(width, height);
        self.scissor = Rect::full(width, height);
    }
}

struct FrameState<D: TextureDevice> {
    target: Option<VulkanTarget>,
    textures: SharedTextureManager<D>,
    pixels: Vec<u8>,
    frames: u64,
    size: (u32, u32),
}

/// Shared between the factory and its contexts.
///
/// Lock order: `frame` before `state`. Every command submission happens
/// under `frame`.
pub(crate) struct VulkanSurface<D: TextureDevice> {
    gpu: Option<VulkanDevice>,
    frame: Mutex<FrameState<D>>,
    publisher: Arc<TexturePublisher<D>>,
    pub(crate) notifier: FrameNotifier,
    pub(crate) state: Mutex<DrawState>,
    pub(crate) render_thread: Mutex<Option<ThreadId>>,
    pub(crate) upload_thread: Mutex<Option<ThreadId>>,
    config: BridgeConfig,
    transfer_failures: LogThrottle,
    valid: AtomicBool,
}

impl<D: TextureDevice> VulkanSurface<D> {
    pub(crate) fn gpu(&self) -> Option<&VulkanDevice> {
        self.gpu.as_ref()
    }

    fn initialize(&self, width: u32, height: u32) -> Result<()> {
        let gpu = self.gpu.as_ref().context("no Vulkan device")?;
        let mut frame = self.frame.lock();
        frame.target = Some(VulkanTarget::create(gpu, width, height)?);
        frame.textures.create_shared_texture(width, height)?;
        frame.size = (width, height);
        self.valid.store(true, Ordering::Release);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------------

    /// Images are recorded on any thread under the frame lock, so a Vulkan
    /// resize is never deferred.
    pub(crate) fn resize(&self, width: u32, height: u32) -> ResizeOutcome {
        if width == 0 || height == 0 {
            warn!("Ignoring resize to {}x{}", width, height);
            return ResizeOutcome::Failed;
        }
        let Some(gpu) = self.gpu.as_ref() else {
            error!("Resize requested on a surface without a Vulkan device");
            return ResizeOutcome::Failed;
        };

        let mut guard = self.frame.lock();
        let frame = &mut *guard;
        if frame.size == (width, height) && frame.textures.is_valid() {
            return ResizeOutcome::Unchanged;
        }
        if frame.target.is_none() {
            error!("Resize requested on a surface that failed to initialize");
            return ResizeOutcome::Failed;
        }

        gpu.wait_idle();
        let target = match VulkanTarget::create(gpu, width, height) {
            Ok(target) => target,
            Err(e) => {
                error!("Render target resize to {}x{} failed: {:#}", width, height, e);
                return ResizeOutcome::Failed;
            }
        };

        let previous = frame.size;
        if let Err(e) = frame.textures.create_shared_texture(width, height) {
            error!("Shared texture resize to {}x{} failed: {:#}", width, height, e);
            target.destroy(gpu);
            match frame.textures.create_shared_texture(previous.0, previous.1) {
                Ok(()) => warn!("Surface kept at {}x{}", previous.0, previous.1),
                Err(e) => error!("Surface has no shared texture: {:#}", e),
            }
            return ResizeOutcome::Failed;
        }

        if let Some(old) = frame.target.replace(target) {
            old.destroy(gpu);
        }
        frame.size = (width, height);
        self.state.lock().reset_view(width, height);
        info!(
            "Surface resized {}x{} -> {}x{}",
            previous.0, previous.1, width, height
        );
        ResizeOutcome::Resized
    }

    // ------------------------------------------------------------------------
    // Draw-side operations
    // ------------------------------------------------------------------------

    pub(crate) fn clear(&self, bits: ClearBits) -> Result<()> {
        let gpu = self.gpu.as_ref().context("no Vulkan device")?;
        let frame = self.frame.lock();
        let target = frame.target.as_ref().context("no render target")?;
        let color = bits
            .contains(ClearBits::COLOR)
            .then(|| self.state.lock().clear_color);
        // Depth and stencil share one image and are cleared together.
        let depth_stencil = (bits.contains(ClearBits::DEPTH) || bits.contains(ClearBits::STENCIL))
            .then_some((1.0, 0));
        if color.is_none() && depth_stencil.is_none() {
            return Ok(());
        }
        target.clear(gpu, color, depth_stencil)
    }

    pub(crate) fn present(&self) -> PresentSignal {
        let transferred = match self.transfer() {
            Ok(_) => true,
            Err(e) => {
                if self.transfer_failures.should_log() {
                    warn!(
                        failures = self.transfer_failures.count(),
                        "Frame dropped: {:#}", e
                    );
                }
                false
            }
        };
        self.notifier.on_present(transferred)
    }

    /// Copy the viewport region of the colour image into the shared texture.
    fn transfer(&self) -> Result<TransferDescriptor> {
        let gpu = self.gpu.as_ref().context("no Vulkan device")?;
        let mut guard = self.frame.lock();
        let frame = &mut *guard;
        let target_size = frame
            .textures
            .current()
            .map(|g| g.dimensions())
            .context("no shared texture")?;
        let target = frame.target.as_ref().context("no render target")?;

        let viewport = self.state.lock().viewport;
        let (width, height) = target.dimensions();
        let region = transfer::read_region(viewport, target_size).clamp_to(width, height);
        if region.is_empty() {
            bail!(
                "viewport {:?} does not overlap the {}x{} surface",
                viewport,
                target_size.0,
                target_size.1
            );
        }

        target.read_back(gpu, region, &mut frame.pixels)?;
        let descriptor = frame
            .textures
            .upload(&frame.pixels, &FrameLayout::vulkan(region))?;
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

impl<D: TextureDevice> Drop for VulkanSurface<D> {
    fn drop(&mut self) {
        self.notifier.disable();
        let frame = self.frame.get_mut();
        if let (Some(target), Some(gpu)) = (frame.target.take(), self.gpu.as_ref()) {
            gpu.wait_idle();
            target.destroy(gpu);
        }
        frame.textures.release();
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

/// Surface factory for Vulkan renderers.
///
/// Owns the colour and depth/stencil images, the shared texture and the
/// notifier. Construction never fails outright: check
/// [`SurfaceFactory::is_valid`].
pub struct VulkanSurfaceFactory<D: TextureDevice> {
    surface: Arc<VulkanSurface<D>>,
    draw: OnceCell<VulkanDrawContext<D>>,
    upload: OnceCell<VulkanUploadContext<D>>,
}

impl<D: TextureDevice> VulkanSurfaceFactory<D> {
    /// Load Vulkan, create a device and build the surface at
    /// `width` x `height`.
    pub fn new(device: D, width: u32, height: u32, config: BridgeConfig) -> Self {
        let gpu = match VulkanDevice::new() {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                error!("Vulkan initialization failed: {:#}", e);
                None
            }
        };
        Self::build(gpu, device, width, height, config)
    }

    /// Build the surface on an existing Vulkan device.
    pub fn with_vulkan(gpu: VulkanDevice, device: D, width: u32, height: u32, config: BridgeConfig) -> Self {
        Self::build(Some(gpu), device, width, height, config)
    }

    fn build(gpu: Option<VulkanDevice>, device: D, width: u32, height: u32, config: BridgeConfig) -> Self {
        let textures = SharedTextureManager::new(device);
        let publisher = textures.publisher().clone();
        let surface = Arc::new(VulkanSurface {
            gpu,
            frame: Mutex::new(FrameState {
                target: None,
                textures,
                pixels: Vec::new(),
                frames: 0,
                size: (0, 0),
            }),
            publisher,
            notifier: FrameNotifier::new(&config),
            state: Mutex::new(DrawState::new(width, height)),
            render_thread: Mutex::new(None),
            upload_thread: Mutex::new(None),
            transfer_failures: LogThrottle::new(config.log_every_n_frames),
            config,
            valid: AtomicBool::new(false),
        });

        match surface.initialize(width, height) {
            Ok(()) => info!("Vulkan surface ready ({}x{})", width, height),
            Err(e) => error!("Vulkan surface initialization failed: {:#}", e),
        }

        Self {
            surface,
            draw: OnceCell::new(),
            upload: OnceCell::new(),
        }
    }

    pub fn vulkan(&self) -> Option<&VulkanDevice> {
        self.surface.gpu()
    }

    pub fn publisher(&self) -> &Arc<TexturePublisher<D>> {
        &self.surface.publisher
    }

    /// State recorded through the draw context.
    pub fn draw_state(&self) -> DrawState {
        *self.surface.state.lock()
    }

    /// Run `f` with the current render target, e.g. to build framebuffers
    /// from its views. Hold no other surface lock while calling.
    pub fn with_target<R>(&self, f: impl FnOnce(&VulkanTarget) -> R) -> Option<R> {
        self.surface.frame.lock().target.as_ref().map(f)
    }

    /// Thread that last made the draw context current.
    pub fn render_thread(&self) -> Option<ThreadId> {
        *self.surface.render_thread.lock()
    }

    /// Thread that last made the upload context current.
    pub fn upload_thread(&self) -> Option<ThreadId> {
        *self.surface.upload_thread.lock()
    }

    pub fn present(&self) -> PresentSignal {
        self.surface.present()
    }

    pub fn frames_transferred(&self) -> u64 {
        self.surface.frame.lock().frames
    }
}

impl<D: TextureDevice> SurfaceFactory for VulkanSurfaceFactory<D> {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn is_valid(&self) -> bool {
        self.surface.valid.load(Ordering::Acquire) && self.surface.publisher.is_valid()
    }

    fn draw_context(&self) -> &dyn DrawSurface {
        self.draw
            .get_or_init(|| VulkanDrawContext::new(self.surface.clone()))
    }

    fn upload_context(&self) -> &dyn ContextBinding {
        self.upload
            .get_or_init(|| VulkanUploadContext::new(self.surface.clone()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_state_starts_full_and_resets_view() {
        let mut state = DrawState::new(640, 480);
        assert_eq!(state.viewport, Rect::full(640, 480));
        assert_eq!(state.scissor, state.viewport);
        assert_eq!(state.stencil_front.function, TestFunction::Always);

        state.viewport = Rect::new(10, 10, 20, 20);
        state.scissor = Rect::new(0, 0, 1, 1);
        state.reset_view(800, 600);
        assert_eq!(state.viewport, Rect::full(800, 600));
        assert_eq!(state.scissor, Rect::full(800, 600));
    }
}
