//! Destination device abstraction: the shared texture the compositor samples
//! and the CPU staging texture frames are written through.

use std::ffi::c_void;
use std::fmt;

use anyhow::Result;

/// A raw pointer handed across the compositor boundary (device, texture or
/// OS handle). Carries no ownership.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawPtr(*mut c_void);

// SAFETY: RawPtr is an opaque value passed to the compositor; this crate
// never dereferences it through this type.
unsafe impl Send for RawPtr {}
unsafe impl Sync for RawPtr {}

impl RawPtr {
    pub const NULL: RawPtr = RawPtr(std::ptr::null_mut());

    pub fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn from_addr(addr: usize) -> Self {
        Self(addr as *mut c_void)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for RawPtr {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for RawPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

/// Pixel format of shared and staging textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit unsigned normalized, B,G,R,A byte order.
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 => 4,
        }
    }
}

/// A mapped staging texture. Rows are `row_pitch` bytes apart; only the
/// first `width * 4` bytes of each row are pixels.
pub struct StagingView<'a> {
    pub data: &'a mut [u8],
    pub row_pitch: usize,
    pub width: u32,
    pub height: u32,
}

impl StagingView<'_> {
    /// The pixel bytes of row `y`, without pitch padding.
    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.row_pitch;
        let len = self.width as usize * PixelFormat::Bgra8.bytes_per_pixel();
        &mut self.data[start..start + len]
    }
}

/// A device that owns shareable BGRA8 textures.
///
/// Textures are created in pairs: a GPU-only texture with an OS shareable
/// handle, and a same-size CPU-writable staging texture. Frames are written
/// into the staging texture, then copied GPU-side into the shared one.
pub trait TextureDevice: Send + Sync + 'static {
    type Texture: Send + Sync + 'static;
    type Staging: Send + Sync + 'static;
    /// Closing the OS handle happens when this is dropped.
    type Handle: Send + Sync + 'static;

    /// Create a shareable texture and its OS handle.
    fn create_shared_texture(&self, width: u32, height: u32)
        -> Result<(Self::Texture, Self::Handle)>;

    fn create_staging_texture(&self, width: u32, height: u32) -> Result<Self::Staging>;

    /// Map `staging` for writing, call `write` with the mapped rows, unmap.
    fn write_staging(
        &self,
        staging: &Self::Staging,
        write: &mut dyn FnMut(StagingView<'_>),
    ) -> Result<()>;

    /// GPU copy of the whole staging texture into the shared texture.
    fn copy_to_shared(&self, shared: &Self::Texture, staging: &Self::Staging) -> Result<()>;

    /// Submit queued device work.
    fn flush(&self);

    fn raw_device(&self) -> RawPtr;
    fn raw_texture(&self, texture: &Self::Texture) -> RawPtr;
    fn raw_handle(&self, handle: &Self::Handle) -> RawPtr;
}
