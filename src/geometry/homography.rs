//! Planar homography estimation.
//!
//! Direct linear transform with Hartley normalization for the 4-point and
//! overdetermined cases, plus the RANSAC refinement used by the tracker to
//! turn ratio-filtered descriptor matches into a robust frame-to-frame (or
//! slide-to-frame) mapping.

use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};

use crate::features::{KeyPoint, Match};

/// Minimum number of correspondences the refinement needs before it will
/// attempt an estimate.
pub const MIN_CORRESPONDENCES: usize = 5;

const RANSAC_ITERATIONS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    /// Apply to a point in homogeneous coordinates and renormalize.
    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        Point2::new(v[0] / v[2], v[1] / v[2])
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };

    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Translate to the centroid and scale so the mean distance is sqrt(2).
fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for p in pts {
        cx += p.x;
        cy += p.y;
    }
    cx /= n;
    cy /= n;

    let mut mean_dist = 0.0;
    for p in pts {
        let dx = p.x - cx;
        let dy = p.y - cy;
        mean_dist += (dx * dx + dy * dy).sqrt();
    }
    mean_dist /= n;

    let t = hartley_normalization(cx, cy, mean_dist);

    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect();

    (out, t)
}

fn normalize_homography(h: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let s = h[(2, 2)];
    if s.abs() < 1e-12 {
        return None;
    }
    Some(h / s)
}

fn denormalize_homography(
    hn: Matrix3<f64>,
    t_src: Matrix3<f64>,
    t_dst: Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let t_dst_inv = t_dst.try_inverse()?;
    normalize_homography(t_dst_inv * hn * t_src)
}

/// Compute H such that `dst ~ H * src` from exactly four correspondences.
pub fn homography_from_4pt(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Option<Homography> {
    // Unknowns: [h11 h12 h13 h21 h22 h23 h31 h32], with h33 = 1.
    // For each correspondence (x,y) -> (u,v):
    //   h11 x + h12 y + h13 - u h31 x - u h32 y = u
    //   h21 x + h22 y + h23 - v h31 x - v h32 y = v
    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for k in 0..4 {
        let x = src_n[k].x;
        let y = src_n[k].y;
        let u = dst_n[k].x;
        let v = dst_n[k].y;

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;

    let hn = Matrix3::new(
        x[0], x[1], x[2], //
        x[3], x[4], x[5], //
        x[6], x[7], 1.0,
    );

    denormalize_homography(hn, t_src, t_dst).map(Homography::new)
}

/// Least-squares DLT over four or more correspondences.
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }

    if src.len() == 4 {
        let s: &[Point2<f64>; 4] = src.try_into().ok()?;
        let d: &[Point2<f64>; 4] = dst.try_into().ok()?;
        return homography_from_4pt(s, d);
    }

    let (s, ts) = normalize_points(src);
    let (d, td) = normalize_points(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);

    for k in 0..n {
        let x = s[k].x;
        let y = s[k].y;
        let u = d[k].x;
        let v = d[k].y;

        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    // Ah = 0: h is the right singular vector with the smallest singular value.
    let svd = a.svd(true, true);
    let vt = svd.v_t?;
    let last = vt.nrows().checked_sub(1)?;
    let h = vt.row(last);

    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    denormalize_homography(hn, ts, td).map(Homography::new)
}

/// Splitmix-style generator for RANSAC sampling; deterministic so tracker
/// runs are reproducible.
struct SampleRng(u64);

impl SampleRng {
    fn new(seed: u64) -> Self {
        Self(seed ^ 0x9e37_79b9_7f4a_7c15)
    }

    fn next_index(&mut self, n: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) % n as u64) as usize
    }

    fn distinct4(&mut self, n: usize) -> [usize; 4] {
        let mut out = [0usize; 4];
        let mut count = 0;
        while count < 4 {
            let idx = self.next_index(n);
            if !out[..count].contains(&idx) {
                out[count] = idx;
                count += 1;
            }
        }
        out
    }
}

/// RANSAC homography refinement over ratio-filtered matches.
///
/// Requires at least [`MIN_CORRESPONDENCES`] matches. Returns the refined
/// homography (or `None` when no consensus exists, the "empty H" case the
/// tracker scores as infinitely bad) together with the inlier matches under
/// the given reprojection threshold in pixels.
pub fn refine_homography(
    keypoints1: &[KeyPoint],
    keypoints2: &[KeyPoint],
    matches: &[Match],
    threshold: f64,
) -> (Option<Homography>, Vec<Match>) {
    if matches.len() < MIN_CORRESPONDENCES {
        return (None, Vec::new());
    }

    let src: Vec<Point2<f64>> = matches
        .iter()
        .map(|m| keypoints1[m.query_idx as usize].point())
        .collect();
    let dst: Vec<Point2<f64>> = matches
        .iter()
        .map(|m| keypoints2[m.train_idx as usize].point())
        .collect();

    let n = matches.len();
    let threshold2 = threshold * threshold;
    let mut rng = SampleRng::new(n as u64);

    let mut best_mask: Vec<bool> = Vec::new();
    let mut best_count = 0usize;

    for _ in 0..RANSAC_ITERATIONS {
        let idx = rng.distinct4(n);
        let sample_src = [src[idx[0]], src[idx[1]], src[idx[2]], src[idx[3]]];
        let sample_dst = [dst[idx[0]], dst[idx[1]], dst[idx[2]], dst[idx[3]]];

        let Some(h) = homography_from_4pt(&sample_src, &sample_dst) else {
            continue;
        };

        let mut mask = vec![false; n];
        let mut count = 0usize;
        for i in 0..n {
            let p = h.apply(src[i]);
            let d2 = (p - dst[i]).norm_squared();
            if d2.is_finite() && d2 < threshold2 {
                mask[i] = true;
                count += 1;
            }
        }

        if count > best_count {
            best_count = count;
            best_mask = mask;
            if best_count == n {
                break;
            }
        }
    }

    if best_count < 4 {
        return (None, Vec::new());
    }

    let inlier_src: Vec<Point2<f64>> = (0..n).filter(|&i| best_mask[i]).map(|i| src[i]).collect();
    let inlier_dst: Vec<Point2<f64>> = (0..n).filter(|&i| best_mask[i]).map(|i| dst[i]).collect();

    let Some(h) = estimate_homography(&inlier_src, &inlier_dst) else {
        return (None, Vec::new());
    };

    // Re-classify against the refined estimate.
    let mut inliers = Vec::with_capacity(best_count);
    for i in 0..n {
        let p = h.apply(src[i]);
        let d2 = (p - dst[i]).norm_squared();
        if d2.is_finite() && d2 < threshold2 {
            inliers.push(matches[i].clone());
        }
    }

    if inliers.len() < 4 {
        return (None, Vec::new());
    }

    (Some(h), inliers)
}
