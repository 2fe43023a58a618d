//! Pixel rectangles in GL window coordinates.

/// An axis-aligned pixel rectangle. `x`/`y` follow GL conventions (origin at
/// the bottom-left for GL, top-left for Vulkan); the rectangle itself carries
/// no orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The rectangle covering a whole `width` x `height` surface.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of bytes needed to hold this rectangle as tightly packed
    /// 32-bit pixels.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Intersect with the surface `[0, width) x [0, height)`.
    ///
    /// A negative origin shrinks the rectangle by the amount cut off; the
    /// result never extends past the surface.
    pub fn clamp_to(self, width: u32, height: u32) -> Rect {
        fn axis(origin: i32, extent: u32, limit: u32) -> (i32, u32) {
            let start = origin.max(0);
            let cut = (start as i64 - origin as i64) as u64;
            let extent = (extent as u64).saturating_sub(cut);
            let room = (limit as i64 - start as i64).max(0) as u64;
            (start.min(limit as i32), extent.min(room) as u32)
        }

        let (x, w) = axis(self.x, self.width, width);
        let (y, h) = axis(self.y, self.height, height);
        Rect::new(x, y, w, h)
    }
}

impl From<[i32; 4]> for Rect {
    fn from(v: [i32; 4]) -> Self {
        Rect::new(v[0], v[1], v[2].max(0) as u32, v[3].max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_rect_inside_surface() {
        assert_eq!(Rect::full(800, 600).clamp_to(1024, 768), Rect::full(800, 600));
        assert_eq!(
            Rect::full(2048, 2048).clamp_to(1024, 768),
            Rect::full(1024, 768)
        );
        assert_eq!(
            Rect::new(1000, 700, 100, 100).clamp_to(1024, 768),
            Rect::new(1000, 700, 24, 68)
        );
    }

    #[test]
    fn clamp_handles_negative_origin() {
        assert_eq!(
            Rect::new(-10, -20, 100, 100).clamp_to(1024, 768),
            Rect::new(0, 0, 90, 80)
        );
        assert!(Rect::new(-200, 0, 100, 100).clamp_to(64, 64).is_empty());
    }

    #[test]
    fn clamp_origin_past_surface_is_empty() {
        let r = Rect::new(2000, 0, 10, 10).clamp_to(1024, 768);
        assert!(r.is_empty());
        assert_eq!(r.x, 1024);
    }

    #[test]
    fn viewport_array_conversion() {
        assert_eq!(Rect::from([0, 0, 640, -1]), Rect::new(0, 0, 640, 0));
    }
}
