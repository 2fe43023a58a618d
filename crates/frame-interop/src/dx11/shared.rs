//! Shared BGRA textures with NT handles, and their staging textures.

use std::ffi::c_void;
use std::slice;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};
use windows::core::{Interface, HRESULT, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, GENERIC_ALL, HANDLE};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::{IDXGIKeyedMutex, IDXGIResource1};

use super::device::Dx11Device;
use crate::config::BridgeConfig;
use crate::texture::{RawPtr, StagingView, TextureDevice};

/// `WAIT_TIMEOUT` surfaced through `AcquireSync`.
const KEYED_MUTEX_TIMEOUT: HRESULT = HRESULT(0x8007_0102_u32 as i32);
const KEYED_MUTEX_KEY: u64 = 0;

/// An NT handle closed on drop.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

// SAFETY: kernel handles are process-wide values; closing is the only
// operation performed through this type.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            if let Err(e) = unsafe { CloseHandle(self.0) } {
                warn!("CloseHandle on shared texture handle failed: {e}");
            }
        }
    }
}

/// GPU-only shared texture with its keyed mutex.
pub struct D3D11SharedTexture {
    texture: ID3D11Texture2D,
    keyed_mutex: IDXGIKeyedMutex,
}

/// CPU-writable staging texture.
pub struct D3D11Staging {
    texture: ID3D11Texture2D,
    width: u32,
    height: u32,
}

// SAFETY: the device is created with multithread protection and every use
// of the immediate context goes through D3D11TextureDevice's context lock.
unsafe impl Send for D3D11SharedTexture {}
unsafe impl Sync for D3D11SharedTexture {}
unsafe impl Send for D3D11Staging {}
unsafe impl Sync for D3D11Staging {}

/// Unmaps subresource 0 of a mapped staging texture, also when the writer
/// panics.
struct Unmap<'a> {
    context: &'a ID3D11DeviceContext,
    texture: &'a ID3D11Texture2D,
}

impl Drop for Unmap<'_> {
    fn drop(&mut self) {
        unsafe { self.context.Unmap(self.texture, 0) };
    }
}

/// D3D11 implementation of [`TextureDevice`].
pub struct D3D11TextureDevice {
    device: Dx11Device,
    /// Serialises immediate-context access (map, copy, flush).
    context_lock: Mutex<()>,
    keyed_mutex_timeout_ms: u32,
}

// SAFETY: see D3D11SharedTexture.
unsafe impl Send for D3D11TextureDevice {}
unsafe impl Sync for D3D11TextureDevice {}

impl D3D11TextureDevice {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        Ok(Self::with_device(Dx11Device::new()?, config))
    }

    pub fn with_device(device: Dx11Device, config: &BridgeConfig) -> Self {
        Self {
            device,
            context_lock: Mutex::new(()),
            keyed_mutex_timeout_ms: config.keyed_mutex_timeout_ms,
        }
    }

    pub fn dx11(&self) -> &Dx11Device {
        &self.device
    }

    fn texture_desc(width: u32, height: u32) -> D3D11_TEXTURE2D_DESC {
        D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            ..Default::default()
        }
    }
}

impl TextureDevice for D3D11TextureDevice {
    type Texture = D3D11SharedTexture;
    type Staging = D3D11Staging;
    type Handle = OwnedHandle;

    fn create_shared_texture(&self, width: u32, height: u32) -> Result<(D3D11SharedTexture, OwnedHandle)> {
        let desc = D3D11_TEXTURE2D_DESC {
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_SHADER_RESOURCE.0 | D3D11_BIND_RENDER_TARGET.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: (D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0
                | D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0) as u32,
            ..Self::texture_desc(width, height)
        };

        let mut texture = None;
        unsafe {
            self.device
                .device()
                .CreateTexture2D(&desc, None, Some(&mut texture as *mut _))
        }
        .with_context(|| format!("CreateTexture2D(shared {width}x{height})"))?;
        let texture = texture.context("CreateTexture2D returned no shared texture")?;

        let resource: IDXGIResource1 = texture
            .cast()
            .context("Failed to cast shared texture to IDXGIResource1")?;
        let handle = unsafe { resource.CreateSharedHandle(None, GENERIC_ALL.0, PCWSTR::null()) }
            .context("CreateSharedHandle")?;
        let handle = OwnedHandle(handle);

        let keyed_mutex: IDXGIKeyedMutex = texture
            .cast()
            .context("Failed to cast shared texture to IDXGIKeyedMutex")?;

        debug!(
            "D3D11 shared texture created ({}x{}, handle {:?})",
            width, height, handle.0 .0
        );
        Ok((
            D3D11SharedTexture {
                texture,
                keyed_mutex,
            },
            handle,
        ))
    }

    fn create_staging_texture(&self, width: u32, height: u32) -> Result<D3D11Staging> {
        let desc = D3D11_TEXTURE2D_DESC {
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
            ..Self::texture_desc(width, height)
        };
        let mut texture = None;
        unsafe {
            self.device
                .device()
                .CreateTexture2D(&desc, None, Some(&mut texture as *mut _))
        }
        .with_context(|| format!("CreateTexture2D(staging {width}x{height})"))?;
        let texture = texture.context("CreateTexture2D returned no staging texture")?;
        Ok(D3D11Staging {
            texture,
            width,
            height,
        })
    }

    fn write_staging(
        &self,
        staging: &D3D11Staging,
        write: &mut dyn FnMut(StagingView<'_>),
    ) -> Result<()> {
        let _lock = self.context_lock.lock();
        let context = self.device.context();

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { context.Map(&staging.texture, 0, D3D11_MAP_WRITE, 0, Some(&mut mapped)) }
            .context("Failed to map staging texture")?;
        let _unmap = Unmap {
            context,
            texture: &staging.texture,
        };
        if mapped.pData.is_null() {
            bail!("staging texture mapped to null");
        }

        let row_pitch = mapped.RowPitch as usize;
        // SAFETY: Map returned a writable region of RowPitch * height bytes
        // that stays valid until `_unmap` drops.
        let data = unsafe {
            slice::from_raw_parts_mut(mapped.pData as *mut u8, row_pitch * staging.height as usize)
        };
        write(StagingView {
            data,
            row_pitch,
            width: staging.width,
            height: staging.height,
        });
        Ok(())
    }

    fn copy_to_shared(&self, shared: &D3D11SharedTexture, staging: &D3D11Staging) -> Result<()> {
        let _lock = self.context_lock.lock();

        match unsafe {
            shared
                .keyed_mutex
                .AcquireSync(KEYED_MUTEX_KEY, self.keyed_mutex_timeout_ms)
        } {
            Ok(()) => {}
            Err(e) if e.code() == KEYED_MUTEX_TIMEOUT => {
                bail!(
                    "keyed mutex not acquired within {} ms",
                    self.keyed_mutex_timeout_ms
                );
            }
            Err(e) => return Err(e).context("Failed to acquire keyed mutex"),
        }

        unsafe {
            self.device
                .context()
                .CopyResource(&shared.texture, &staging.texture);
        }

        unsafe { shared.keyed_mutex.ReleaseSync(KEYED_MUTEX_KEY) }
            .context("Failed to release keyed mutex")?;
        Ok(())
    }

    fn flush(&self) {
        let _lock = self.context_lock.lock();
        unsafe { self.device.context().Flush() };
    }

    fn raw_device(&self) -> RawPtr {
        RawPtr::new(self.device.device().as_raw() as *mut c_void)
    }

    fn raw_texture(&self, texture: &D3D11SharedTexture) -> RawPtr {
        RawPtr::new(texture.texture.as_raw() as *mut c_void)
    }

    fn raw_handle(&self, handle: &OwnedHandle) -> RawPtr {
        RawPtr::new(handle.0 .0 as *mut c_void)
    }
}
