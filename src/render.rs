//! Software fills for shm buffers
//!
//! Only whole-surface fills exist: a flat color or a two-color checkerboard
//! whose colors come from the shared [`RenderState`].

use crate::config::RenderConfig;
use crate::shm::PixelBuffer;
use log::debug;

/// Colors the input router flips and the redraw reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderState {
    pub first_color: u32,
    pub second_color: u32,
    /// Number of color swaps so far
    pub toggles: u64,
    /// Number of paced redraws so far
    pub frames: u64,
}

impl RenderState {
    pub fn new(first_color: u32, second_color: u32) -> Self {
        Self {
            first_color,
            second_color,
            toggles: 0,
            frames: 0,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(config.first_color, config.second_color)
    }

    /// Exchange the two checkerboard colors
    pub fn swap_colors(&mut self) {
        std::mem::swap(&mut self.first_color, &mut self.second_color);
        self.toggles += 1;
        debug!(
            "🎨 Swapped colors (#{}): {:08X}/{:08X}",
            self.toggles, self.first_color, self.second_color
        );
    }

    pub fn advance_frame(&mut self) {
        self.frames = self.frames.wrapping_add(1);
    }
}

/// What a window paints into its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Solid(u32),
    /// Checkerboard of the render state's two colors, `tile` pixels per square
    Checkerboard { tile: u32 },
}

impl Fill {
    /// Color a fresh buffer starts out with
    pub fn background(&self, state: &RenderState) -> u32 {
        match self {
            Fill::Solid(color) => *color,
            Fill::Checkerboard { .. } => state.first_color,
        }
    }

    pub fn paint(&self, buffer: &mut PixelBuffer, state: &RenderState) {
        match *self {
            Fill::Solid(color) => buffer.fill(color),
            Fill::Checkerboard { tile } => {
                let tile = tile.max(1);
                let (first, second) = (state.first_color, state.second_color);
                buffer.paint(|x, y| {
                    if ((x / tile) + (y / tile)) % 2 == 0 {
                        first
                    } else {
                        second
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_colors_counts_toggles() {
        let mut state = RenderState::new(0xFF666666, 0xFFEEEEEE);
        state.swap_colors();
        assert_eq!(state.first_color, 0xFFEEEEEE);
        assert_eq!(state.second_color, 0xFF666666);
        state.swap_colors();
        assert_eq!(state.first_color, 0xFF666666);
        assert_eq!(state.toggles, 2);
    }

    #[test]
    fn test_background_follows_fill() {
        let state = RenderState::new(1, 2);
        assert_eq!(Fill::Solid(9).background(&state), 9);
        assert_eq!(Fill::Checkerboard { tile: 8 }.background(&state), 1);
    }
}
