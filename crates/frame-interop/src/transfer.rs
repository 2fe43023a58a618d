//! Readback-to-staging pixel conversion.
//!
//! GL reads pixels bottom-up in RGBA order; the shared texture is top-down
//! BGRA. Vulkan readbacks are already top-down. [`convert_into`] handles both
//! and takes care of frames that are smaller than the destination.

use crate::region::Rect;
use crate::texture::StagingView;

/// Written to staging pixels outside the rendered region.
pub const OPAQUE_BLACK: [u8; 4] = [0, 0, 0, 255];

/// Vertical order of rows in a readback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrder {
    /// First row in memory is the bottom of the image (GL).
    BottomUp,
    /// First row in memory is the top of the image (Vulkan, D3D).
    TopDown,
}

/// Byte order of each pixel in a readback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgba,
    Bgra,
}

/// Shape of a tightly packed readback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Region of the render target the pixels came from.
    pub region: Rect,
    pub row_order: RowOrder,
    pub channel_order: ChannelOrder,
}

impl FrameLayout {
    /// Layout of a `glReadPixels(GL_RGBA)` readback.
    pub fn gl(region: Rect) -> Self {
        Self {
            region,
            row_order: RowOrder::BottomUp,
            channel_order: ChannelOrder::Rgba,
        }
    }

    /// Layout of an `R8G8B8A8` image copied into a tightly packed buffer.
    pub fn vulkan(region: Rect) -> Self {
        Self {
            region,
            row_order: RowOrder::TopDown,
            channel_order: ChannelOrder::Rgba,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.region.byte_len()
    }
}

/// What a successful transfer copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// Source region that was read back.
    pub source: Rect,
    /// Size of the destination texture.
    pub target: (u32, u32),
    /// Row pitch of the mapped staging texture.
    pub row_pitch: usize,
}

impl TransferDescriptor {
    /// Whether the source covered the whole destination.
    pub fn is_full_frame(&self) -> bool {
        (self.source.width, self.source.height) == self.target
    }
}

/// The part of `viewport` that can be read into a `target`-sized texture.
pub fn read_region(viewport: Rect, target: (u32, u32)) -> Rect {
    viewport.clamp_to(target.0, target.1)
}

/// Write `pixels` (laid out as `layout`) into the top-left of `view`.
///
/// When the source does not cover the whole view, the view is first cleared
/// to opaque black so no stale or uninitialized memory reaches the
/// compositor. Source rows missing from a short buffer are left black.
pub fn convert_into(pixels: &[u8], layout: &FrameLayout, view: &mut StagingView<'_>) {
    let src_stride = layout.region.width as usize * 4;
    let copy_w = layout.region.width.min(view.width) as usize;
    let copy_h = layout.region.height.min(view.height) as usize;
    let available_rows = if src_stride == 0 {
        0
    } else {
        pixels.len() / src_stride
    };

    let full = copy_w == view.width as usize
        && copy_h == view.height as usize
        && available_rows >= layout.region.height as usize;
    if !full {
        for y in 0..view.height as usize {
            for px in view.row_mut(y).chunks_exact_mut(4) {
                px.copy_from_slice(&OPAQUE_BLACK);
            }
        }
    }

    let src_height = layout.region.height as usize;
    for y in 0..copy_h {
        let src_y = match layout.row_order {
            RowOrder::BottomUp => src_height - 1 - y,
            RowOrder::TopDown => y,
        };
        if src_y >= available_rows {
            continue;
        }
        let start = src_y * src_stride;
        let src = &pixels[start..start + copy_w * 4];
        let dst = &mut view.row_mut(y)[..copy_w * 4];
        match layout.channel_order {
            ChannelOrder::Bgra => dst.copy_from_slice(src),
            ChannelOrder::Rgba => {
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                    d[0] = s[2];
                    d[1] = s[1];
                    d[2] = s[0];
                    d[3] = s[3];
                }
            }
        }
    }
}

/// Sparse check for any non-zero byte, used for frame diagnostics.
pub fn has_content(pixels: &[u8]) -> bool {
    const PROBES: usize = 64;
    if pixels.is_empty() {
        return false;
    }
    let step = (pixels.len() / PROBES).max(1);
    pixels.iter().step_by(step).any(|&b| b != 0) || pixels[pixels.len() - 1] != 0
}
