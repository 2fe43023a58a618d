//! Software texture device with process-local shareable handles.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::texture::{PixelFormat, RawPtr, StagingView, TextureDevice};

/// Fill byte for freshly allocated staging memory, so unwritten pixels are
/// recognisable.
pub const UNINITIALIZED: u8 = 0xCD;

const FIRST_HANDLE: usize = 0x1000;

/// A shared texture: top-down BGRA, tightly packed.
#[derive(Debug)]
pub struct HeadlessTexture {
    width: u32,
    height: u32,
    pixels: Mutex<Vec<u8>>,
}

impl HeadlessTexture {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// BGRA of the pixel at `(x, y)`, top-left origin.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let pixels = self.pixels.lock();
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [pixels[i], pixels[i + 1], pixels[i + 2], pixels[i + 3]]
    }

    pub fn pixels(&self) -> Vec<u8> {
        self.pixels.lock().clone()
    }
}

/// CPU-writable staging texture with a padded row pitch.
#[derive(Debug)]
pub struct HeadlessStaging {
    width: u32,
    height: u32,
    row_pitch: usize,
    data: Mutex<Vec<u8>>,
}

impl HeadlessStaging {
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }
}

/// Process-local stand-in for an NT handle. Dropping it closes it.
#[derive(Debug)]
pub struct HeadlessHandle {
    id: usize,
    open: Arc<AtomicUsize>,
}

impl HeadlessHandle {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HeadlessHandle {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// In-memory texture device.
#[derive(Debug)]
pub struct HeadlessTextureDevice {
    next_handle: AtomicUsize,
    open_handles: Arc<AtomicUsize>,
    failing_allocations: AtomicU32,
    row_alignment: usize,
    copies: AtomicU64,
    flushes: AtomicU64,
}

impl Default for HeadlessTextureDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessTextureDevice {
    /// Staging rows are padded to 256 bytes, like typical GPU row pitches.
    pub fn new() -> Self {
        Self::with_row_alignment(256)
    }

    pub fn with_row_alignment(row_alignment: usize) -> Self {
        Self {
            next_handle: AtomicUsize::new(FIRST_HANDLE),
            open_handles: Arc::new(AtomicUsize::new(0)),
            failing_allocations: AtomicU32::new(0),
            row_alignment: row_alignment.max(1),
            copies: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Make the next `count` texture allocations fail.
    pub fn fail_allocations(&self, count: u32) {
        self.failing_allocations.store(count, Ordering::Release);
    }

    /// Handles created and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    pub fn copies(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn check_allocation(&self, what: &str, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            bail!("{what} size must be non-zero, got {width}x{height}");
        }
        let injected = self
            .failing_allocations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            bail!("{what} allocation failed ({width}x{height})");
        }
        Ok(())
    }
}

impl TextureDevice for HeadlessTextureDevice {
    type Texture = HeadlessTexture;
    type Staging = HeadlessStaging;
    type Handle = HeadlessHandle;

    fn create_shared_texture(&self, width: u32, height: u32) -> Result<(HeadlessTexture, HeadlessHandle)> {
        self.check_allocation("shared texture", width, height)?;
        let texture = HeadlessTexture {
            width,
            height,
            pixels: Mutex::new(vec![0; width as usize * height as usize * 4]),
        };
        // Spaced like kernel handle values.
        let id = self.next_handle.fetch_add(4, Ordering::Relaxed);
        self.open_handles.fetch_add(1, Ordering::AcqRel);
        let handle = HeadlessHandle {
            id,
            open: self.open_handles.clone(),
        };
        Ok((texture, handle))
    }

    fn create_staging_texture(&self, width: u32, height: u32) -> Result<HeadlessStaging> {
        self.check_allocation("staging texture", width, height)?;
        let bpp = PixelFormat::Bgra8.bytes_per_pixel();
        let row_pitch = (width as usize * bpp).next_multiple_of(self.row_alignment);
        Ok(HeadlessStaging {
            width,
            height,
            row_pitch,
            data: Mutex::new(vec![UNINITIALIZED; row_pitch * height as usize]),
        })
    }

    fn write_staging(
        &self,
        staging: &HeadlessStaging,
        write: &mut dyn FnMut(StagingView<'_>),
    ) -> Result<()> {
        let mut data = staging.data.lock();
        write(StagingView {
            data: &mut data[..],
            row_pitch: staging.row_pitch,
            width: staging.width,
            height: staging.height,
        });
        Ok(())
    }

    fn copy_to_shared(&self, shared: &HeadlessTexture, staging: &HeadlessStaging) -> Result<()> {
        if (shared.width, shared.height) != (staging.width, staging.height) {
            bail!(
                "staging {}x{} does not match shared texture {}x{}",
                staging.width,
                staging.height,
                shared.width,
                shared.height
            );
        }
        let src = staging.data.lock();
        let mut dst = shared.pixels.lock();
        let row_bytes = shared.width as usize * PixelFormat::Bgra8.bytes_per_pixel();
        for (y, row) in dst.chunks_exact_mut(row_bytes).enumerate() {
            let start = y * staging.row_pitch;
            row.copy_from_slice(&src[start..start + row_bytes]);
        }
        self.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn raw_device(&self) -> RawPtr {
        RawPtr::new(self as *const Self as *mut c_void)
    }

    fn raw_texture(&self, texture: &HeadlessTexture) -> RawPtr {
        RawPtr::new(texture as *const HeadlessTexture as *mut c_void)
    }

    fn raw_handle(&self, handle: &HeadlessHandle) -> RawPtr {
        RawPtr::from_addr(handle.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_closed_on_drop() {
        let device = HeadlessTextureDevice::new();
        let (_a, ha) = device.create_shared_texture(4, 4).unwrap();
        let (_b, hb) = device.create_shared_texture(4, 4).unwrap();
        assert_ne!(ha.id(), hb.id());
        assert_eq!(device.open_handles(), 2);
        drop(ha);
        assert_eq!(device.open_handles(), 1);
        drop(hb);
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn staging_rows_are_padded() {
        let device = HeadlessTextureDevice::with_row_alignment(64);
        let staging = device.create_staging_texture(10, 2).unwrap();
        assert_eq!(staging.row_pitch(), 64);
    }

    #[test]
    fn copy_skips_row_padding() {
        let device = HeadlessTextureDevice::with_row_alignment(16);
        let (shared, _h) = device.create_shared_texture(2, 2).unwrap();
        let staging = device.create_staging_texture(2, 2).unwrap();
        device
            .write_staging(&staging, &mut |mut view| {
                view.row_mut(0).copy_from_slice(&[1; 8]);
                view.row_mut(1).copy_from_slice(&[2; 8]);
            })
            .unwrap();
        device.copy_to_shared(&shared, &staging).unwrap();
        assert_eq!(shared.pixels(), [[1u8; 8], [2u8; 8]].concat());
        assert_eq!(device.copies(), 1);
    }

    #[test]
    fn staging_stays_writable_after_a_panicking_writer() {
        let device = HeadlessTextureDevice::new();
        let (shared, _h) = device.create_shared_texture(1, 1).unwrap();
        let staging = device.create_staging_texture(1, 1).unwrap();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = device.write_staging(&staging, &mut |_| panic!("writer failed"));
        }));
        assert!(panicked.is_err());

        device
            .write_staging(&staging, &mut |mut view| {
                view.row_mut(0).copy_from_slice(&[9; 4]);
            })
            .unwrap();
        device.copy_to_shared(&shared, &staging).unwrap();
        assert_eq!(shared.pixels(), vec![9u8; 4]);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let device = HeadlessTextureDevice::new();
        device.fail_allocations(1);
        assert!(device.create_shared_texture(4, 4).is_err());
        assert!(device.create_shared_texture(4, 4).is_ok());
        assert!(device.create_staging_texture(0, 4).is_err());
    }

    #[test]
    fn mismatched_copy_is_rejected() {
        let device = HeadlessTextureDevice::new();
        let (shared, _h) = device.create_shared_texture(4, 4).unwrap();
        let staging = device.create_staging_texture(2, 2).unwrap();
        assert!(device.copy_to_shared(&shared, &staging).is_err());
    }
}
