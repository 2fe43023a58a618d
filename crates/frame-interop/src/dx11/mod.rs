//! Direct3D11 destination device (Windows).

pub mod device;
pub mod shared;

pub use device::Dx11Device;
pub use shared::{D3D11SharedTexture, D3D11Staging, D3D11TextureDevice, OwnedHandle};
