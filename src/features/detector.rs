//! Binary keypoint detector.
//!
//! FAST-9 segment-test corners over a small bilinear pyramid, oriented by
//! intensity centroid, described by 256 rotated point-pair comparisons on a
//! box-blurred patch. The result is a BRISK-class detector: binary
//! descriptors with rotation invariance from the orientation and scale
//! invariance from the pyramid.

use crate::features::base::{Descriptors, KeyPoint, DESCRIPTOR_SIZE};
use crate::io::image::GrayImage;

/// Offsets of the 16-pixel Bresenham circle of radius 3 used by the segment
/// test, in clockwise order.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Contiguous circle pixels required by the segment test.
const SEGMENT_LENGTH: usize = 9;

/// Radius of the orientation patch.
const ORIENTATION_RADIUS: i32 = 15;

/// Half-extent of the descriptor sampling pattern. Rotated samples stay
/// within `ceil(13 * sqrt(2)) = 19` pixels of the keypoint.
const PATTERN_RADIUS: i32 = 13;

/// Keypoints closer than this to a level border are discarded so the
/// orientation patch and every rotated descriptor sample stay in bounds.
const BORDER: i32 = 20;

/// Smallest pyramid level dimension worth detecting on.
const MIN_LEVEL_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    /// Segment-test intensity threshold.
    pub threshold: u8,
    /// Keep at most this many keypoints, strongest first.
    pub max_features: usize,
    /// Number of pyramid levels.
    pub levels: u32,
    /// Downscale factor between pyramid levels.
    pub scale_factor: f32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            threshold: 20,
            max_features: 1500,
            levels: 4,
            scale_factor: 1.2,
        }
    }
}

/// FAST + rotated binary descriptor extractor.
pub struct BinaryDetector {
    params: DetectorParams,
    /// 256 point pairs within the descriptor patch.
    pattern: Vec<(i32, i32, i32, i32)>,
}

impl BinaryDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self {
            params,
            pattern: sampling_pattern(),
        }
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect keypoints and compute their descriptors.
    ///
    /// Keypoint coordinates are reported in full-resolution image space
    /// regardless of the pyramid level they were found on. Row `i` of the
    /// descriptor matrix corresponds to keypoint `i`.
    pub fn detect_and_compute(&self, image: &GrayImage) -> (Vec<KeyPoint>, Descriptors) {
        let mut keypoints: Vec<KeyPoint> = Vec::new();
        let mut rows: Vec<[u8; DESCRIPTOR_SIZE]> = Vec::new();

        let mut level_image = image.clone();
        let mut scale = 1.0f32;

        for level in 0..self.params.levels {
            if level > 0 {
                let w = (image.width as f32 / self.params.scale_factor.powi(level as i32)).round()
                    as u32;
                let h = (image.height as f32 / self.params.scale_factor.powi(level as i32)).round()
                    as u32;
                if w < MIN_LEVEL_SIZE || h < MIN_LEVEL_SIZE {
                    break;
                }
                level_image = image.resize_bilinear(w, h);
                scale = self.params.scale_factor.powi(level as i32);
            }

            let corners = self.detect_level(&level_image);
            if corners.is_empty() {
                continue;
            }

            let blurred = box_blur5(&level_image);
            for (x, y, response) in corners {
                let angle = orientation(&level_image, x, y);
                let descriptor = self.describe(&blurred, x, y, angle);
                keypoints.push(KeyPoint {
                    x: x as f32 * scale,
                    y: y as f32 * scale,
                    response,
                    scale,
                    angle,
                });
                rows.push(descriptor);
            }
        }

        // Strongest first, bounded by the feature budget.
        let mut order: Vec<usize> = (0..keypoints.len()).collect();
        order.sort_by(|&a, &b| {
            keypoints[b]
                .response
                .partial_cmp(&keypoints[a].response)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(self.params.max_features);

        let mut out_keypoints = Vec::with_capacity(order.len());
        let mut out_descriptors = Descriptors::with_capacity(order.len());
        for idx in order {
            out_keypoints.push(keypoints[idx]);
            out_descriptors.push(&rows[idx]);
        }

        (out_keypoints, out_descriptors)
    }

    /// Segment-test corners with non-maximum suppression on one level.
    fn detect_level(&self, image: &GrayImage) -> Vec<(i32, i32, f32)> {
        let w = image.width as i32;
        let h = image.height as i32;
        if w <= 2 * BORDER || h <= 2 * BORDER {
            return Vec::new();
        }

        let t = self.params.threshold as i32;
        let mut scores = vec![0.0f32; (w * h) as usize];
        let mut candidates: Vec<(i32, i32)> = Vec::new();

        for y in BORDER..h - BORDER {
            for x in BORDER..w - BORDER {
                let center = image.get(x, y) as i32;

                let mut brighter = [false; 16];
                let mut darker = [false; 16];
                for (i, (dx, dy)) in CIRCLE.iter().enumerate() {
                    let p = image.get(x + dx, y + dy) as i32;
                    brighter[i] = p > center + t;
                    darker[i] = p < center - t;
                }

                if !has_segment(&brighter) && !has_segment(&darker) {
                    continue;
                }

                let mut score = 0.0f32;
                for (dx, dy) in CIRCLE.iter() {
                    let p = image.get(x + dx, y + dy) as i32;
                    score += ((p - center).abs() - t).max(0) as f32;
                }

                scores[(y * w + x) as usize] = score;
                candidates.push((x, y));
            }
        }

        let mut corners = Vec::new();
        for (x, y) in candidates {
            let score = scores[(y * w + x) as usize];
            let mut is_max = true;
            'nms: for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    if scores[((y + dy) * w + x + dx) as usize] > score {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                corners.push((x, y, score));
            }
        }

        corners
    }

    /// 256-bit descriptor from rotated point-pair comparisons.
    fn describe(&self, blurred: &GrayImage, x: i32, y: i32, angle: f32) -> [u8; DESCRIPTOR_SIZE] {
        let (sin, cos) = angle.sin_cos();
        let mut descriptor = [0u8; DESCRIPTOR_SIZE];

        for (k, &(x1, y1, x2, y2)) in self.pattern.iter().enumerate() {
            let rotate = |px: i32, py: i32| -> (i32, i32) {
                let rx = cos * px as f32 - sin * py as f32;
                let ry = sin * px as f32 + cos * py as f32;
                (x + rx.round() as i32, y + ry.round() as i32)
            };

            let (ax, ay) = rotate(x1, y1);
            let (bx, by) = rotate(x2, y2);

            if blurred.get(ax, ay) < blurred.get(bx, by) {
                descriptor[k / 8] |= 1 << (k % 8);
            }
        }

        descriptor
    }
}

/// True if 9 or more contiguous entries are set, wrapping around the circle.
fn has_segment(flags: &[bool; 16]) -> bool {
    let mut run = 0usize;
    for i in 0..16 + SEGMENT_LENGTH {
        if flags[i % 16] {
            run += 1;
            if run >= SEGMENT_LENGTH {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Orientation by intensity centroid over a circular patch.
fn orientation(image: &GrayImage, x: i32, y: i32) -> f32 {
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    let mut m10 = 0.0f32;
    let mut m01 = 0.0f32;

    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = image.get(x + dx, y + dy) as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }

    m01.atan2(m10)
}

/// 5x5 box blur via a summed-area table.
fn box_blur5(image: &GrayImage) -> GrayImage {
    let w = image.width as usize;
    let h = image.height as usize;
    if w == 0 || h == 0 {
        return image.clone();
    }

    let mut integral = vec![0u32; (w + 1) * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u32;
        for x in 0..w {
            row_sum += image.data[y * w + x] as u32;
            integral[(y + 1) * (w + 1) + x + 1] = integral[y * (w + 1) + x + 1] + row_sum;
        }
    }

    let mut data = vec![0u8; w * h];
    for y in 0..h {
        let y0 = y.saturating_sub(2);
        let y1 = (y + 3).min(h);
        for x in 0..w {
            let x0 = x.saturating_sub(2);
            let x1 = (x + 3).min(w);
            let sum = integral[y1 * (w + 1) + x1] + integral[y0 * (w + 1) + x0]
                - integral[y0 * (w + 1) + x1]
                - integral[y1 * (w + 1) + x0];
            let area = ((y1 - y0) * (x1 - x0)) as u32;
            data[y * w + x] = (sum / area) as u8;
        }
    }

    GrayImage::new(image.width, image.height, data)
}

/// Fixed point-pair pattern, generated once from a constant-seeded generator
/// so every detector instance describes keypoints identically.
fn sampling_pattern() -> Vec<(i32, i32, i32, i32)> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut next = move || -> i32 {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let span = (2 * PATTERN_RADIUS + 1) as u64;
        ((state >> 33) % span) as i32 - PATTERN_RADIUS
    };

    let mut pattern = Vec::with_capacity(DESCRIPTOR_SIZE * 8);
    while pattern.len() < DESCRIPTOR_SIZE * 8 {
        let pair = (next(), next(), next(), next());
        // A pair comparing a point against itself carries no information.
        if (pair.0, pair.1) == (pair.2, pair.3) {
            continue;
        }
        pattern.push(pair);
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    /// White canvas with one solid dark square, corners at known positions.
    fn square_image() -> GrayImage {
        let mut data = vec![230u8; 160 * 120];
        for y in 40..80 {
            for x in 60..100 {
                data[y * 160 + x] = 20;
            }
        }
        GrayImage::new(160, 120, data)
    }

    #[test]
    fn detects_square_corners() {
        let detector = BinaryDetector::new(DetectorParams::default());
        let (keypoints, descriptors) = detector.detect_and_compute(&square_image());

        assert!(!keypoints.is_empty());
        assert_eq!(descriptors.count, keypoints.len());

        let expected = [(60.0, 40.0), (99.0, 40.0), (60.0, 79.0), (99.0, 79.0)];
        for (ex, ey) in expected {
            let hit = keypoints
                .iter()
                .any(|kp| (kp.x - ex).abs() <= 3.0 && (kp.y - ey).abs() <= 3.0);
            assert!(hit, "no keypoint near corner ({ex}, {ey})");
        }
    }

    #[test]
    fn detection_is_deterministic() {
        let detector = BinaryDetector::new(DetectorParams::default());
        let image = square_image();

        let (kps_a, desc_a) = detector.detect_and_compute(&image);
        let (kps_b, desc_b) = detector.detect_and_compute(&image);

        assert_eq!(kps_a.len(), kps_b.len());
        assert_eq!(desc_a.data, desc_b.data);
        for (a, b) in kps_a.iter().zip(&kps_b) {
            assert_eq!((a.x, a.y, a.angle), (b.x, b.y, b.angle));
        }
    }

    #[test]
    fn uniform_image_has_no_keypoints() {
        let detector = BinaryDetector::new(DetectorParams::default());
        let image = GrayImage::new(160, 120, vec![128; 160 * 120]);
        let (keypoints, descriptors) = detector.detect_and_compute(&image);
        assert!(keypoints.is_empty());
        assert!(descriptors.is_empty());
    }

    #[test]
    fn feature_budget_is_honored() {
        let params = DetectorParams {
            max_features: 2,
            ..DetectorParams::default()
        };
        let detector = BinaryDetector::new(params);
        let (keypoints, descriptors) = detector.detect_and_compute(&square_image());
        assert!(keypoints.len() <= 2);
        assert_eq!(descriptors.count, keypoints.len());
    }

    #[test]
    fn segment_test_requires_contiguity() {
        let mut flags = [false; 16];
        for i in 0..9 {
            flags[i] = true;
        }
        assert!(has_segment(&flags));

        let mut wrapped = [false; 16];
        for i in 12..16 {
            wrapped[i] = true;
        }
        for i in 0..5 {
            wrapped[i] = true;
        }
        assert!(has_segment(&wrapped));

        let mut broken = [true; 16];
        broken[3] = false;
        broken[11] = false;
        assert!(!has_segment(&broken));
    }
}
