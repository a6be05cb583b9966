//! Fixed-dimension RGBA8 pixel buffer for the matrix.
//!
//! **Why**: The hardware panel is a small fixed grid; a single flat `Vec<u8>`
//! in RGBA order keeps blits cheap and hands off to drivers without
//! conversion.
//!
//! **Used by**: Engine (direct render target), Vegas compositor (strip
//! blitting), drivers (present / PNG dump).

use std::path::Path;

/// Frame errors (PNG export, dimension mismatches)
#[derive(Debug)]
pub enum FrameError {
    Encode(String),
    Io(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Encode(e) => write!(f, "PNG encode error: {}", e),
            FrameError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// Single RGBA8 frame sized to the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>, // RGBA, row-major
}

impl Frame {
    /// Create a black, fully opaque frame.
    pub fn new(width: u32, height: u32) -> Self {
        let mut data = vec![0u8; (width * height * 4) as usize];
        for px in data.chunks_mut(4) {
            px[3] = 255;
        }
        Self { width, height, data }
    }

    /// Create a frame filled with a solid color.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut frame = Self::new(width, height);
        frame.fill(rgba);
        frame
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Fill the whole frame with one color.
    pub fn fill(&mut self, rgba: [u8; 4]) {
        for px in self.data.chunks_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    /// Reset to opaque black.
    pub fn clear(&mut self) {
        self.fill([0, 0, 0, 255]);
    }

    /// Set one pixel; out-of-bounds coordinates are ignored.
    pub fn set_pixel(&mut self, x: i32, y: i32, rgba: [u8; 4]) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return;
        }
        let off = ((y as u32 * self.width + x as u32) * 4) as usize;
        self.data[off..off + 4].copy_from_slice(&rgba);
    }

    /// Read one pixel; out-of-bounds returns None.
    pub fn get_pixel(&self, x: i32, y: i32) -> Option<[u8; 4]> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return None;
        }
        let off = ((y as u32 * self.width + x as u32) * 4) as usize;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.data[off..off + 4]);
        Some(px)
    }

    /// Fill a rectangle, clipped to the frame.
    pub fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, rgba: [u8; 4]) {
        for yy in y..y + h as i32 {
            for xx in x..x + w as i32 {
                self.set_pixel(xx, yy, rgba);
            }
        }
    }

    /// Copy `src` onto this frame at (x, y), clipped on all sides.
    ///
    /// Opaque copy, no alpha blending: segments own their strip slots, the
    /// last blit at a position wins.
    pub fn blit(&mut self, src: &Frame, x: i32, y: i32) {
        // Visible overlap in destination coordinates
        let dst_x0 = x.max(0);
        let dst_y0 = y.max(0);
        let dst_x1 = (x + src.width as i32).min(self.width as i32);
        let dst_y1 = (y + src.height as i32).min(self.height as i32);
        if dst_x0 >= dst_x1 || dst_y0 >= dst_y1 {
            return;
        }

        let row_px = (dst_x1 - dst_x0) as usize;
        for dy in dst_y0..dst_y1 {
            let sy = (dy - y) as usize;
            let sx = (dst_x0 - x) as usize;
            let s_off = (sy * src.width as usize + sx) * 4;
            let d_off = (dy as usize * self.width as usize + dst_x0 as usize) * 4;
            self.data[d_off..d_off + row_px * 4]
                .copy_from_slice(&src.data[s_off..s_off + row_px * 4]);
        }
    }

    /// Write the frame as a PNG (debug dumps).
    pub fn save_png(&self, path: &Path) -> Result<(), FrameError> {
        let img: image::RgbaImage =
            image::ImageBuffer::from_raw(self.width, self.height, self.data.clone())
                .ok_or_else(|| FrameError::Encode("buffer size mismatch".into()))?;
        img.save(path).map_err(|e| FrameError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_opaque_black() {
        let frame = Frame::new(4, 2);
        assert_eq!(frame.get_pixel(0, 0), Some([0, 0, 0, 255]));
        assert_eq!(frame.get_pixel(3, 1), Some([0, 0, 0, 255]));
        assert_eq!(frame.get_pixel(4, 0), None);
    }

    #[test]
    fn test_set_pixel_ignores_out_of_bounds() {
        let mut frame = Frame::new(2, 2);
        frame.set_pixel(-1, 0, [255, 0, 0, 255]);
        frame.set_pixel(2, 0, [255, 0, 0, 255]);
        assert_eq!(frame.get_pixel(0, 0), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_blit_clips_left_edge() {
        let mut dst = Frame::new(4, 1);
        let src = Frame::solid(3, 1, [9, 9, 9, 255]);
        dst.blit(&src, -2, 0);
        // Only the last column of src lands at x=0
        assert_eq!(dst.get_pixel(0, 0), Some([9, 9, 9, 255]));
        assert_eq!(dst.get_pixel(1, 0), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_blit_clips_right_edge() {
        let mut dst = Frame::new(4, 1);
        let src = Frame::solid(3, 1, [7, 7, 7, 255]);
        dst.blit(&src, 3, 0);
        assert_eq!(dst.get_pixel(3, 0), Some([7, 7, 7, 255]));
        assert_eq!(dst.get_pixel(2, 0), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_fill_rect_clipped() {
        let mut frame = Frame::new(3, 3);
        frame.fill_rect(2, 2, 5, 5, [1, 2, 3, 255]);
        assert_eq!(frame.get_pixel(2, 2), Some([1, 2, 3, 255]));
        assert_eq!(frame.get_pixel(1, 1), Some([0, 0, 0, 255]));
    }
}
