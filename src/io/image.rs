//! Raster types shared across the pipeline.
//!
//! Footage frames arrive as packed RGB24 and are reduced to grayscale for
//! feature work; slides are grayscale from the start and only expanded back
//! to RGB when they are handed to the video encoder.

/// Single-channel 8-bit raster, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub width: u32,
    pub height: u32,
    /// Row-major luma samples, `len == width * height`.
    pub data: Vec<u8>,
}

impl GrayImage {
    /// Build an image from raw samples. `data` must hold `width * height`
    /// bytes.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize);
        Self {
            width,
            height,
            data,
        }
    }

    /// Zero-sized placeholder, used before the first keyframe exists.
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sample with border clamp to black, like the source rasters the
    /// detector was tuned on.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor() as i32;
        let y0 = y.floor() as i32;
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let p00 = self.get(x0, y0) as f32;
        let p10 = self.get(x0 + 1, y0) as f32;
        let p01 = self.get(x0, y0 + 1) as f32;
        let p11 = self.get(x0 + 1, y0 + 1) as f32;

        let a = p00 + fx * (p10 - p00);
        let b = p01 + fx * (p11 - p01);
        a + fy * (b - a)
    }

    /// Bilinear resample to the given dimensions.
    pub fn resize_bilinear(&self, width: u32, height: u32) -> GrayImage {
        let mut data = vec![0u8; width as usize * height as usize];
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;

        for y in 0..height {
            for x in 0..width {
                let src_x = (x as f32 + 0.5) * sx - 0.5;
                let src_y = (y as f32 + 0.5) * sy - 0.5;
                let v = self.sample_bilinear(src_x, src_y).clamp(0.0, 255.0) as u8;
                data[y as usize * width as usize + x as usize] = v;
            }
        }

        GrayImage {
            width,
            height,
            data,
        }
    }
}

/// Packed RGB24 raster, row-major without padding.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    /// `len == width * height * 3`.
    pub data: Vec<u8>,
}

impl RgbFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            width,
            height,
            data,
        }
    }

    /// BT.601 luma reduction.
    pub fn to_gray(&self) -> GrayImage {
        let mut gray = Vec::with_capacity(self.width as usize * self.height as usize);
        for chunk in self.data.chunks_exact(3) {
            let r = chunk[0] as f32;
            let g = chunk[1] as f32;
            let b = chunk[2] as f32;
            let luma = (0.299 * r + 0.587 * g + 0.114 * b).round() as u8;
            gray.push(luma);
        }
        GrayImage::new(self.width, self.height, gray)
    }

    /// Expand a grayscale slide into the RGB frame the encoder consumes.
    pub fn from_gray(gray: &GrayImage) -> RgbFrame {
        let mut data = Vec::with_capacity(gray.data.len() * 3);
        for &v in &gray.data {
            data.extend_from_slice(&[v, v, v]);
        }
        RgbFrame::new(gray.width, gray.height, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_roundtrips_through_rgb() {
        let gray = GrayImage::new(2, 2, vec![0, 85, 170, 255]);
        let rgb = RgbFrame::from_gray(&gray);
        assert_eq!(rgb.to_gray(), gray);
    }

    #[test]
    fn get_clamps_outside_to_black() {
        let gray = GrayImage::new(2, 1, vec![10, 20]);
        assert_eq!(gray.get(-1, 0), 0);
        assert_eq!(gray.get(0, 5), 0);
        assert_eq!(gray.get(1, 0), 20);
    }

    #[test]
    fn resize_preserves_constant_images() {
        let gray = GrayImage::new(8, 8, vec![77; 64]);
        let small = gray.resize_bilinear(3, 5);
        assert_eq!(small.width, 3);
        assert_eq!(small.height, 5);
        assert!(small.data.iter().all(|&v| v == 77));
    }
}
