//! Shared texture lifecycle.
//!
//! A [`Generation`] is one shared texture, its OS handle and its staging
//! texture, all at one size. Resizing replaces the whole generation. The
//! [`TexturePublisher`] is what other threads see: readers clone the
//! current `Arc<Generation>` and keep using it even if a resize retires it
//! meanwhile, so handles they obtained stay valid until they let go.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::bridge::SurfaceDescriptor;
use crate::texture::{RawPtr, TextureDevice};
use crate::transfer::{self, FrameLayout, TransferDescriptor};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// One set of destination resources.
pub struct Generation<D: TextureDevice> {
    // Field order is drop order: the OS handle closes first, then the staging
    // texture is released, then the shared texture.
    handle: D::Handle,
    staging: D::Staging,
    texture: D::Texture,
    width: u32,
    height: u32,
    id: u64,
}

impl<D: TextureDevice> Generation<D> {
    pub fn handle(&self) -> &D::Handle {
        &self.handle
    }

    pub fn staging(&self) -> &D::Staging {
        &self.staging
    }

    pub fn texture(&self) -> &D::Texture {
        &self.texture
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Process-unique, increasing with every allocation.
    pub fn id(&self) -> u64 {
        self.id
    }
}

// ----------------------------------------------------------------------------
// Publisher
// ----------------------------------------------------------------------------

/// Thread-safe view of the current generation.
pub struct TexturePublisher<D: TextureDevice> {
    device: Arc<D>,
    current: RwLock<Option<Arc<Generation<D>>>>,
}

impl<D: TextureDevice> TexturePublisher<D> {
    fn new(device: Arc<D>) -> Self {
        Self {
            device,
            current: RwLock::new(None),
        }
    }

    fn publish(&self, generation: Arc<Generation<D>>) {
        *self.current.write() = Some(generation);
    }

    fn retract(&self) -> Option<Arc<Generation<D>>> {
        self.current.write().take()
    }

    /// The current generation, if any.
    pub fn snapshot(&self) -> Option<Arc<Generation<D>>> {
        self.current.read().clone()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_valid(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.current.read().as_ref().map(|g| g.dimensions())
    }

    pub fn shared_handle(&self) -> RawPtr {
        self.current
            .read()
            .as_ref()
            .map_or(RawPtr::NULL, |g| self.device.raw_handle(&g.handle))
    }

    pub fn texture_ptr(&self) -> RawPtr {
        self.current
            .read()
            .as_ref()
            .map_or(RawPtr::NULL, |g| self.device.raw_texture(&g.texture))
    }

    pub fn device_ptr(&self) -> RawPtr {
        self.device.raw_device()
    }

    /// Compositor descriptor for the current generation.
    pub fn describe(&self, requested_width: u32, requested_height: u32) -> Option<SurfaceDescriptor> {
        let current = self.current.read();
        let generation = current.as_ref()?;
        Some(SurfaceDescriptor::new(
            self.device.raw_handle(&generation.handle),
            generation.width,
            generation.height,
            requested_width,
            requested_height,
        ))
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

/// Owns generation allocation for one surface. Used only by the thread that
/// holds the surface's frame lock; other threads go through the publisher.
pub struct SharedTextureManager<D: TextureDevice> {
    device: Arc<D>,
    publisher: Arc<TexturePublisher<D>>,
    current: Option<Arc<Generation<D>>>,
}

impl<D: TextureDevice> SharedTextureManager<D> {
    pub fn new(device: D) -> Self {
        let device = Arc::new(device);
        Self {
            publisher: Arc::new(TexturePublisher::new(device.clone())),
            device,
            current: None,
        }
    }

    pub fn publisher(&self) -> &Arc<TexturePublisher<D>> {
        &self.publisher
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn current(&self) -> Option<&Arc<Generation<D>>> {
        self.current.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.current.as_ref().map_or((0, 0), |g| g.dimensions())
    }

    /// Release the current generation, then allocate and publish a new one.
    ///
    /// On failure nothing is published and the manager stays invalid until
    /// the next successful call. Readers holding the retired generation keep
    /// it alive until they drop it.
    pub fn create_shared_texture(&mut self, width: u32, height: u32) -> Result<()> {
        self.release();

        let (texture, handle) = self
            .device
            .create_shared_texture(width, height)
            .with_context(|| format!("creating {width}x{height} shared texture"))?;
        let staging = self
            .device
            .create_staging_texture(width, height)
            .with_context(|| format!("creating {width}x{height} staging texture"))?;

        let generation = Arc::new(Generation {
            handle,
            staging,
            texture,
            width,
            height,
            id: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        });
        debug!(
            "Shared texture generation {} published ({}x{}, handle {:?})",
            generation.id,
            width,
            height,
            self.device.raw_handle(&generation.handle)
        );
        self.current = Some(generation.clone());
        self.publisher.publish(generation);
        Ok(())
    }

    /// Retract and drop the current generation.
    pub fn release(&mut self) {
        self.publisher.retract();
        if let Some(old) = self.current.take() {
            debug!(
                "Shared texture generation {} retired ({} outstanding references)",
                old.id,
                Arc::strong_count(&old) - 1
            );
        }
    }

    /// Write a readback into the current generation: staging conversion,
    /// GPU copy into the shared texture, device flush.
    pub fn upload(&self, pixels: &[u8], layout: &FrameLayout) -> Result<TransferDescriptor> {
        let generation = self
            .current
            .as_ref()
            .context("no shared texture to upload into")?;

        let mut row_pitch = 0;
        self.device.write_staging(&generation.staging, &mut |mut view| {
            row_pitch = view.row_pitch;
            transfer::convert_into(pixels, layout, &mut view);
        })?;
        if let Err(e) = self.device.copy_to_shared(&generation.texture, &generation.staging) {
            error!("Staging to shared texture copy failed: {e:#}");
            return Err(e);
        }
        self.device.flush();

        Ok(TransferDescriptor {
            source: layout.region,
            target: generation.dimensions(),
            row_pitch,
        })
    }
}

impl<D: TextureDevice> Drop for SharedTextureManager<D> {
    fn drop(&mut self) {
        self.release();
    }
}
