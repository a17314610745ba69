//! Projective geometry primitives for slide pose tracking.

pub mod homography;
pub mod quad;

pub use homography::{estimate_homography, homography_from_4pt, refine_homography, Homography};
pub use quad::{deviation, quad_perspective, Quad};
