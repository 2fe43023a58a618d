//! D3D11 device wrapper.
//!
//! Holds the device and its immediate context. Multithread protection is
//! switched on because the copy runs on the renderer's thread while the
//! compositor opens the shared handle on its own device.

use anyhow::{bail, Context, Result};
use windows::core::Interface;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;

use tracing::{debug, error, info};

/// A D3D11 device with an immediate context.
pub struct Dx11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    driver_type: D3D_DRIVER_TYPE,
}

impl Dx11Device {
    /// Create a BGRA-capable device, preferring hardware and falling back to
    /// WARP (CI/headless machines).
    pub fn new() -> Result<Self> {
        let driver_types = [D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP];
        let feature_levels = [D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0];

        for &driver_type in &driver_types {
            let mut device = None;
            let mut context = None;
            let hr = unsafe {
                D3D11CreateDevice(
                    None,
                    driver_type,
                    HMODULE::default(),
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    Some(&feature_levels),
                    D3D11_SDK_VERSION,
                    Some(&mut device as *mut _),
                    None,
                    Some(&mut context as *mut _),
                )
            };
            match (hr, device, context) {
                (Ok(()), Some(device), Some(context)) => {
                    debug!("D3D11 device created with driver type {:?}", driver_type);
                    enable_multithread_protection(&context)?;
                    if driver_type == D3D_DRIVER_TYPE_WARP {
                        info!("D3D11 running on WARP (software rasterizer)");
                    }
                    return Ok(Self {
                        device,
                        context,
                        driver_type,
                    });
                }
                (Err(e), _, _) => debug!("D3D11CreateDevice({:?}) failed: {e}", driver_type),
                _ => debug!("D3D11CreateDevice({:?}) returned no device", driver_type),
            }
        }

        error!("Failed to create D3D11 device with any driver type");
        bail!("D3D11 is unavailable")
    }

    /// Borrow the underlying `ID3D11Device`.
    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    /// Borrow the immediate device context.
    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    pub fn driver_type(&self) -> D3D_DRIVER_TYPE {
        self.driver_type
    }

    pub fn is_warp(&self) -> bool {
        self.driver_type == D3D_DRIVER_TYPE_WARP
    }
}

fn enable_multithread_protection(context: &ID3D11DeviceContext) -> Result<()> {
    let multithread: ID3D11Multithread = context
        .cast()
        .context("Failed to cast immediate context to ID3D11Multithread")?;
    unsafe {
        let _ = multithread.SetMultithreadProtected(true);
    }
    Ok(())
}
