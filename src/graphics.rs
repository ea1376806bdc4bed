//! The 64x32 monochrome framebuffer and its sprite-XOR drawing rules.
use std::ops::Index;

use fixedbitset::FixedBitSet;

/// Width of the display in pixels.
pub const WIDTH: usize = 64;
/// Height of the display in pixels.
pub const HEIGHT: usize = 32;

/// A row-major bit buffer of pixel states. Sprites are drawn by XOR, so a
/// second draw of the same sprite at the same spot erases it; the collision
/// flag reports whether any lit pixel was cleared that way.
pub(crate) struct Graphics {
    buffer: FixedBitSet,
}

impl Graphics {
    pub fn new() -> Self {
        Graphics {
            buffer: FixedBitSet::with_capacity(WIDTH * HEIGHT),
        }
    }

    pub fn len(&self) -> usize {
        WIDTH * HEIGHT
    }

    /// Buffer index of the pixel at (x, y). Coordinates off the edge of the
    /// display wrap around to the opposite side.
    fn idx(x: usize, y: usize) -> usize {
        (x % WIDTH) + WIDTH * (y % HEIGHT)
    }

    /// XOR one sprite bit into the pixel at (x, y). Returns true if the
    /// pixel was lit and this draw cleared it.
    fn xor_pixel(&mut self, x: usize, y: usize) -> bool {
        let idx = Self::idx(x, y);
        let cleared = self.buffer[idx];
        self.buffer.set(idx, !cleared);
        cleared
    }

    /// Draw a sprite of up to 15 rows with its top-left corner at (x, y),
    /// one byte per 8-pixel row, most significant bit leftmost. Returns true
    /// if any previously lit pixel was cleared by the draw.
    pub fn draw_sprite(&mut self, x: u8, y: u8, rows: &[u8]) -> bool {
        let mut collided = false;
        for (row, &bits) in rows.iter().enumerate() {
            for col in 0..8 {
                if (bits >> (7 - col)) & 1 == 1 {
                    collided |= self.xor_pixel(x as usize + col, y as usize + row);
                }
            }
        }
        collided
    }

    /// Set every pixel to off.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Snapshot of the pixel states, row-major.
    pub fn pixels(&self) -> Vec<bool> {
        (0..self.len()).map(|i| self.buffer[i]).collect()
    }
}

impl Index<usize> for Graphics {
    type Output = bool;

    #[inline]
    fn index(&self, bit: usize) -> &Self::Output {
        &self.buffer[bit]
    }
}
