//! C ABI for the compositor plugin.
//!
//! Every export forwards to the process-wide [`BridgeHost`] and never
//! unwinds across the boundary: panics are caught, logged and turned into
//! the export's failure value.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use frame_interop::{FrameCallback, PixelFormat, RawPtr, Registration, ResizeOutcome};
use once_cell::sync::Lazy;
use tracing::error;

use crate::config::HostConfig;
use crate::host::BridgeHost;

static HOST: Lazy<BridgeHost> = Lazy::new(|| BridgeHost::init(HostConfig::from_env()));

/// Plain C callback invoked on frame-ready or keep-alive.
pub type FrameReadyCallback = Option<unsafe extern "C" fn()>;

/// C mirror of [`frame_interop::SurfaceDescriptor`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiSurfaceDescriptor {
    pub handle: *mut c_void,
    pub width: u32,
    pub height: u32,
    pub visible_width: u32,
    pub visible_height: u32,
    /// `DXGI_FORMAT` value; always `DXGI_FORMAT_B8G8R8A8_UNORM` (87).
    pub dxgi_format: u32,
    /// Always 0: the bridge owns the handle.
    pub has_release_callback: u8,
}

const DXGI_FORMAT_B8G8R8A8_UNORM: u32 = 87;

fn guard<R>(name: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!(export = name, "Panic caught at the C boundary");
            fallback
        }
    }
}

fn wrap(callback: FrameReadyCallback) -> Option<FrameCallback> {
    let callback = callback?;
    Some(Arc::new(move || {
        // SAFETY: the compositor guarantees the function stays callable until
        // it is replaced or the surface is destroyed.
        unsafe { callback() }
    }))
}

fn registration_code(registration: Registration) -> i32 {
    match registration {
        Registration::Installed => 0,
        Registration::Replaced => 1,
        Registration::Rejected => -1,
    }
}

fn resize_code(outcome: Option<ResizeOutcome>) -> i32 {
    match outcome {
        Some(ResizeOutcome::Unchanged) => 0,
        Some(ResizeOutcome::Resized) => 1,
        Some(ResizeOutcome::Deferred) => 2,
        Some(ResizeOutcome::Failed) => -1,
        None => -2,
    }
}

/// Create the surface. Returns 1 on success, 0 on failure.
#[no_mangle]
pub extern "C" fn frame_bridge_create_surface(width: i32, height: i32, density: f32) -> i32 {
    guard("frame_bridge_create_surface", 0, || {
        match HOST.create_surface(width, height, density) {
            Ok(()) => 1,
            Err(e) => {
                error!("Surface creation failed: {e:#}");
                0
            }
        }
    })
}

/// Resize the surface. Returns 0 unchanged, 1 resized, 2 deferred, -1 failed,
/// -2 without a surface.
#[no_mangle]
pub extern "C" fn frame_bridge_on_size_changed(width: i32, height: i32) -> i32 {
    guard("frame_bridge_on_size_changed", -1, || {
        resize_code(HOST.on_size_changed(width, height))
    })
}

#[no_mangle]
pub extern "C" fn frame_bridge_on_surface_destroyed() {
    guard("frame_bridge_on_surface_destroyed", (), || {
        HOST.destroy_surface();
    })
}

#[no_mangle]
pub extern "C" fn frame_bridge_get_shared_texture_handle() -> *mut c_void {
    guard("frame_bridge_get_shared_texture_handle", RawPtr::NULL, || {
        HOST.shared_texture_handle()
    })
    .as_ptr()
}

#[no_mangle]
pub extern "C" fn frame_bridge_get_d3d11_device() -> *mut c_void {
    guard("frame_bridge_get_d3d11_device", RawPtr::NULL, || HOST.d3d11_device()).as_ptr()
}

#[no_mangle]
pub extern "C" fn frame_bridge_get_d3d11_texture() -> *mut c_void {
    guard("frame_bridge_get_d3d11_texture", RawPtr::NULL, || HOST.d3d11_texture()).as_ptr()
}

/// Returns 0 installed, 1 replaced, -1 rejected.
#[no_mangle]
pub extern "C" fn frame_bridge_set_frame_ready_callback(callback: FrameReadyCallback) -> i32 {
    guard("frame_bridge_set_frame_ready_callback", -1, || {
        registration_code(HOST.set_frame_callback(wrap(callback)))
    })
}

/// Returns 0 installed, 1 replaced, -1 rejected.
#[no_mangle]
pub extern "C" fn frame_bridge_set_keep_alive_callback(callback: FrameReadyCallback) -> i32 {
    guard("frame_bridge_set_keep_alive_callback", -1, || {
        registration_code(HOST.set_keep_alive_callback(wrap(callback)))
    })
}

/// Returns 1 if the frame-ready callback ran, 0 if it was throttled or
/// nothing is registered.
#[no_mangle]
pub extern "C" fn frame_bridge_notify_frame_ready() -> i32 {
    guard("frame_bridge_notify_frame_ready", 0, || {
        i32::from(HOST.notify_frame_ready())
    })
}

/// Fill `out` with the current surface. Returns 1 on success, 0 while no
/// valid surface exists or `out` is null.
///
/// # Safety
///
/// `out` must be null or point to writable memory for one
/// [`FfiSurfaceDescriptor`].
#[no_mangle]
pub unsafe extern "C" fn frame_bridge_sample_surface(
    requested_width: u32,
    requested_height: u32,
    out: *mut FfiSurfaceDescriptor,
) -> i32 {
    if out.is_null() {
        return 0;
    }
    let descriptor = guard("frame_bridge_sample_surface", None, || {
        HOST.sample(requested_width, requested_height)
    });
    let Some(descriptor) = descriptor else {
        return 0;
    };
    let dxgi_format = match descriptor.format {
        PixelFormat::Bgra8 => DXGI_FORMAT_B8G8R8A8_UNORM,
    };
    // SAFETY: checked non-null above; validity is the caller's contract.
    unsafe {
        out.write(FfiSurfaceDescriptor {
            handle: descriptor.handle.as_ptr(),
            width: descriptor.width,
            height: descriptor.height,
            visible_width: descriptor.visible_width,
            visible_height: descriptor.visible_height,
            dxgi_format,
            has_release_callback: u8::from(descriptor.has_release_callback),
        });
    }
    1
}

/// Destroy the surface and drop both callbacks.
#[no_mangle]
pub extern "C" fn frame_bridge_shutdown() {
    guard("frame_bridge_shutdown", (), || {
        HOST.destroy_surface();
        HOST.set_frame_callback(None);
        HOST.set_keep_alive_callback(None);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes() {
        assert_eq!(registration_code(Registration::Installed), 0);
        assert_eq!(registration_code(Registration::Rejected), -1);
        assert_eq!(resize_code(Some(ResizeOutcome::Deferred)), 2);
        assert_eq!(resize_code(None), -2);
    }

    #[test]
    fn null_callback_clears() {
        assert!(wrap(None).is_none());
    }

    #[test]
    fn panics_become_fallbacks() {
        assert_eq!(guard("test", 7, || -> i32 { panic!("boom") }), 7);
        assert_eq!(guard("test", 7, || 3), 3);
    }

    #[test]
    fn sample_rejects_null_output() {
        // SAFETY: a null output pointer is part of the contract.
        assert_eq!(unsafe { frame_bridge_sample_surface(0, 0, std::ptr::null_mut()) }, 0);
    }
}
