//! [`BridgeHost`] owns the surface factory for one compositor texture and the
//! callbacks the compositor registered, and maps compositor lifecycle events
//! onto the factory.

use std::sync::Arc;

#[cfg(target_os = "windows")]
use anyhow::Context;
use anyhow::{bail, Result};
use frame_interop::{
    ContextBinding, DrawSurface, FrameCallback, RawPtr, Registration, ResizeOutcome,
    SurfaceDescriptor, SurfaceFactory,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{Backend, HostConfig};
use crate::{crash, logging};

pub struct BridgeHost {
    config: HostConfig,
    surface: RwLock<Option<Arc<dyn SurfaceFactory>>>,
    // Kept here so callbacks registered before `create_surface` (or across
    // a destroy/create cycle) reach the next factory.
    frame_callback: Mutex<Option<FrameCallback>>,
    keep_alive_callback: Mutex<Option<FrameCallback>>,
    density: Mutex<f32>,
}

impl BridgeHost {
    /// Create a host and install process-wide logging and crash handling.
    pub fn init(config: HostConfig) -> Self {
        logging::init(config.log_filter.as_deref());
        crash::install(&config.dump_dir());
        info!(backend = ?config.backend, "Frame bridge host initialized");
        Self::new(config)
    }

    /// Create a host without touching process-wide state.
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            surface: RwLock::new(None),
            frame_callback: Mutex::new(None),
            keep_alive_callback: Mutex::new(None),
            density: Mutex::new(1.0),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Surface lifecycle
    // ------------------------------------------------------------------------

    /// Build a surface at `width` x `height`, replacing any existing one.
    /// The existing surface stays in place if the new one fails to build.
    /// `density` is the compositor's scale factor and only recorded.
    pub fn create_surface(&self, width: i32, height: i32, density: f32) -> Result<()> {
        let (width, height) = surface_size(width, height)?;
        info!(width, height, density, "Creating surface");

        let factory = self.build_factory(width, height)?;
        if !factory.is_valid() {
            bail!("surface factory failed to initialize at {width}x{height}");
        }

        if let Some(callback) = self.frame_callback.lock().clone() {
            factory.set_frame_callback(Some(callback));
        }
        if let Some(callback) = self.keep_alive_callback.lock().clone() {
            factory.set_keep_alive_callback(Some(callback));
        }

        *self.density.lock() = density;
        let previous = self.surface.write().replace(factory);
        if let Some(previous) = previous {
            warn!("Surface already existed, replaced it");
            previous.shutdown();
        }
        Ok(())
    }

    fn build_factory(&self, width: u32, height: u32) -> Result<Arc<dyn SurfaceFactory>> {
        let bridge = self.config.bridge.clone();
        let backend = self.config.backend.resolve();
        debug!(?backend, "Building surface factory");

        match backend {
            Backend::Headless => Ok(Arc::new(frame_interop::HeadlessFactory::new(
                frame_interop::headless::HeadlessGl::new(),
                frame_interop::headless::HeadlessTextureDevice::new(),
                width,
                height,
                bridge,
            ))),
            #[cfg(target_os = "windows")]
            Backend::Wgl => {
                let gl = frame_interop::gl_backend::wgl::WglApi::new()
                    .context("Failed to create WGL contexts")?;
                let device = frame_interop::dx11::D3D11TextureDevice::new(&bridge)
                    .context("Failed to create D3D11 device")?;
                Ok(Arc::new(frame_interop::WglD3D11Factory::new(
                    gl, device, width, height, bridge,
                )))
            }
            #[cfg(not(target_os = "windows"))]
            Backend::Wgl => bail!("the WGL backend is only available on Windows"),
            #[cfg(all(feature = "vulkan", target_os = "windows"))]
            Backend::Vulkan => {
                let device = frame_interop::dx11::D3D11TextureDevice::new(&bridge)
                    .context("Failed to create D3D11 device")?;
                Ok(Arc::new(frame_interop::vulkan::VulkanSurfaceFactory::new(
                    device, width, height, bridge,
                )))
            }
            #[cfg(all(feature = "vulkan", not(target_os = "windows")))]
            Backend::Vulkan => Ok(Arc::new(frame_interop::vulkan::VulkanSurfaceFactory::new(
                frame_interop::headless::HeadlessTextureDevice::new(),
                width,
                height,
                bridge,
            ))),
            #[cfg(not(feature = "vulkan"))]
            Backend::Vulkan => bail!("built without the `vulkan` feature"),
            Backend::Auto => bail!("backend did not resolve"),
        }
    }

    /// Forward a compositor resize. `None` when no surface exists.
    pub fn on_size_changed(&self, width: i32, height: i32) -> Option<ResizeOutcome> {
        let surface = self.surface()?;
        let outcome = match surface_size(width, height) {
            Ok((width, height)) => surface.set_surface_size(width, height),
            Err(e) => {
                warn!("Ignoring resize: {e:#}");
                ResizeOutcome::Failed
            }
        };
        debug!(width, height, ?outcome, "Surface size changed");
        Some(outcome)
    }

    /// Silence notifications, then release the factory and its GPU
    /// resources. Returns whether a surface existed.
    pub fn destroy_surface(&self) -> bool {
        let Some(surface) = self.surface.write().take() else {
            return false;
        };
        surface.shutdown();
        drop(surface);
        info!("Surface destroyed");
        true
    }

    pub fn has_surface(&self) -> bool {
        self.surface.read().is_some()
    }

    /// The current factory. Callers holding the `Arc` keep it alive past a
    /// concurrent `destroy_surface`.
    pub fn surface(&self) -> Option<Arc<dyn SurfaceFactory>> {
        self.surface.read().clone()
    }

    pub fn density(&self) -> f32 {
        *self.density.lock()
    }

    // ------------------------------------------------------------------------
    // Compositor queries
    // ------------------------------------------------------------------------

    pub fn shared_texture_handle(&self) -> RawPtr {
        self.surface()
            .map_or(RawPtr::NULL, |s| s.shared_texture_handle())
    }

    pub fn d3d11_device(&self) -> RawPtr {
        self.surface().map_or(RawPtr::NULL, |s| s.d3d11_device())
    }

    pub fn d3d11_texture(&self) -> RawPtr {
        self.surface().map_or(RawPtr::NULL, |s| s.d3d11_texture())
    }

    pub fn sample(&self, requested_width: u32, requested_height: u32) -> Option<SurfaceDescriptor> {
        self.surface()?.sample(requested_width, requested_height)
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Retain `callback` and install it on the current surface, if any.
    /// Without a surface the result is `Installed` or `Replaced` relative to
    /// the retained callback.
    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Registration {
        let previous = std::mem::replace(&mut *self.frame_callback.lock(), callback.clone());
        match self.surface() {
            Some(surface) => surface.set_frame_callback(callback),
            None => retained(previous.is_some(), callback.is_some()),
        }
    }

    pub fn set_keep_alive_callback(&self, callback: Option<FrameCallback>) -> Registration {
        let previous = std::mem::replace(&mut *self.keep_alive_callback.lock(), callback.clone());
        match self.surface() {
            Some(surface) => surface.set_keep_alive_callback(callback),
            None => retained(previous.is_some(), callback.is_some()),
        }
    }

    /// Rate-limited frame-ready notification outside of present, for the
    /// renderer's own frame hooks. Returns whether the callback ran.
    pub fn notify_frame_ready(&self) -> bool {
        self.surface()
            .is_some_and(|s| s.notifier().notify_frame_ready())
    }

    // ------------------------------------------------------------------------
    // Renderer access
    // ------------------------------------------------------------------------

    pub fn with_draw_context<R>(&self, f: impl FnOnce(&dyn DrawSurface) -> R) -> Option<R> {
        let surface = self.surface()?;
        Some(f(surface.draw_context()))
    }

    pub fn with_upload_context<R>(&self, f: impl FnOnce(&dyn ContextBinding) -> R) -> Option<R> {
        let surface = self.surface()?;
        Some(f(surface.upload_context()))
    }
}

impl Drop for BridgeHost {
    fn drop(&mut self) {
        self.destroy_surface();
    }
}

fn surface_size(width: i32, height: i32) -> Result<(u32, u32)> {
    match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => bail!("invalid surface size {width}x{height}"),
    }
}

fn retained(had_previous: bool, has_new: bool) -> Registration {
    if had_previous || !has_new {
        Registration::Replaced
    } else {
        Registration::Installed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_sizes_must_be_positive() {
        assert_eq!(surface_size(800, 600).unwrap(), (800, 600));
        assert!(surface_size(0, 600).is_err());
        assert!(surface_size(800, -1).is_err());
    }

    #[cfg(not(feature = "vulkan"))]
    #[test]
    fn failed_replacement_keeps_the_existing_surface() {
        let mut host = BridgeHost::new(HostConfig {
            backend: Backend::Headless,
            ..HostConfig::default()
        });
        host.create_surface(16, 16, 1.0).unwrap();
        let first = host.surface().unwrap();

        host.config.backend = Backend::Vulkan;
        assert!(host.create_surface(32, 32, 2.0).is_err());

        let current = host.surface().unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert!(current.notifier().is_enabled());
        assert_eq!(host.density(), 1.0);
        assert_eq!(host.sample(0, 0).map(|d| (d.width, d.height)), Some((16, 16)));
    }

    #[test]
    fn retained_registration_outcomes() {
        assert_eq!(retained(false, true), Registration::Installed);
        assert_eq!(retained(true, true), Registration::Replaced);
        assert_eq!(retained(true, false), Registration::Replaced);
    }
}
