//! Two-dimensional quad descriptor (polygon with four vertices).

use nalgebra::{Point2, Vector2};

use crate::geometry::homography::Homography;

/// Polygon with four ordered vertices and precomputed edge normals.
///
/// Construction computes the (non-unit) edge normals
/// `n_i = (y_{i+1} - y_i, x_i - x_{i+1})`, the convex-clockwise predicate
/// and the signed area, so the per-step pose checks stay cheap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quad {
    vertices: [Point2<f64>; 4],
    normals: [Vector2<f64>; 4],
    convex_clockwise: bool,
    area: f64,
}

impl Quad {
    /// Build a quad from its vertex coordinates, in order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        x3: f64,
        y3: f64,
        x4: f64,
        y4: f64,
    ) -> Self {
        let vertices = [
            Point2::new(x1, y1),
            Point2::new(x2, y2),
            Point2::new(x3, y3),
            Point2::new(x4, y4),
        ];

        let mut normals = [Vector2::zeros(); 4];
        for i in 0..4 {
            let a = vertices[i];
            let b = vertices[(i + 1) % 4];
            normals[i] = Vector2::new(b.y - a.y, a.x - b.x);
        }

        let mut convex_clockwise = true;
        for i in 0..4 {
            if normals[i].perp(&normals[(i + 1) % 4]) > 0.0 {
                convex_clockwise = false;
                break;
            }
        }

        // Sum of the two triangles (v1 v2 v3) and (v3 v4 v1); positive for a
        // convex clockwise quad in image coordinates.
        let area = -0.5 * (normals[0].perp(&normals[1]) + normals[2].perp(&normals[3]));

        Self {
            vertices,
            normals,
            convex_clockwise,
            area,
        }
    }

    /// The page rectangle of a `width x height` slide, in the vertex order
    /// the tracker projects through homographies.
    pub fn page(width: f64, height: f64) -> Self {
        Self::new(0.0, 0.0, 0.0, height, width, height, width, 0.0)
    }

    #[inline]
    pub fn vertex(&self, i: usize) -> Point2<f64> {
        self.vertices[i]
    }

    #[inline]
    pub fn vertices(&self) -> &[Point2<f64>; 4] {
        &self.vertices
    }

    #[inline]
    pub fn convex_clockwise(&self) -> bool {
        self.convex_clockwise
    }

    #[inline]
    pub fn area(&self) -> f64 {
        self.area
    }

    /// Transform this quad by a perspective homography.
    pub fn perspective(&self, homography: &Homography) -> Quad {
        let p: Vec<Point2<f64>> = self
            .vertices
            .iter()
            .map(|v| homography.apply(*v))
            .collect();
        Quad::new(
            p[0].x, p[0].y, p[1].x, p[1].y, p[2].x, p[2].y, p[3].x, p[3].y,
        )
    }

    /// True if the point lies within the quad.
    ///
    /// Only well-behaved for convex clockwise quads. For a counterclockwise
    /// quad the result is inverted, and for a non-convex one it is arbitrary
    /// (but pure and panic-free).
    pub fn inside(&self, x: f64, y: f64) -> bool {
        let p = Point2::new(x, y);
        for i in 0..4 {
            if (p - self.vertices[i]).dot(&self.normals[i]) < 0.0 {
                return false;
            }
        }
        true
    }
}

impl Default for Quad {
    /// The degenerate all-zero quad. Its area is zero, which the tracker's
    /// pose checks reject.
    fn default() -> Self {
        Quad::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
    }
}

/// Robust perspective transform which maps a missing homography to the
/// degenerate quad instead of failing.
pub fn quad_perspective(quad: &Quad, homography: Option<&Homography>) -> Quad {
    match homography {
        Some(h) => quad.perspective(h),
        None => Quad::default(),
    }
}

/// Deviation and deformation between two quads.
///
/// Deviation is the magnitude of the mean corner displacement; deformation
/// is the largest residual displacement after removing that mean.
pub fn deviation(first: &Quad, second: &Quad) -> (f64, f64) {
    let diffs: Vec<Vector2<f64>> = (0..4)
        .map(|i| second.vertex(i) - first.vertex(i))
        .collect();

    let mean = (diffs[0] + diffs[1] + diffs[2] + diffs[3]) / 4.0;

    let mut max_residual2 = 0.0f64;
    for d in &diffs {
        let residual2 = (d - mean).norm_squared();
        if residual2 > max_residual2 {
            max_residual2 = residual2;
        }
    }

    (mean.norm(), max_residual2.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn page_quad_is_convex_clockwise_with_page_area() {
        let quad = Quad::page(640.0, 480.0);
        assert!(quad.convex_clockwise());
        assert!((quad.area() - 640.0 * 480.0).abs() < 1e-9);
    }

    #[test]
    fn reversed_page_quad_is_not_clockwise() {
        let quad = Quad::new(0.0, 0.0, 640.0, 0.0, 640.0, 480.0, 0.0, 480.0);
        assert!(!quad.convex_clockwise());
    }

    #[test]
    fn convex_clockwise_implies_nonnegative_area() {
        let quads = [
            Quad::page(1.0, 1.0),
            Quad::page(320.0, 240.0),
            Quad::new(10.0, 5.0, 12.0, 105.0, 210.0, 98.0, 205.0, 8.0),
        ];
        for quad in quads {
            if quad.convex_clockwise() {
                assert!(quad.area() >= 0.0);
            }
        }
    }

    #[test]
    fn vertices_and_center_are_inside() {
        let quad = Quad::page(100.0, 50.0);
        for i in 0..4 {
            let v = quad.vertex(i);
            assert!(quad.inside(v.x, v.y));
        }
        assert!(quad.inside(50.0, 25.0));
        assert!(!quad.inside(150.0, 25.0));
        assert!(!quad.inside(50.0, -1.0));
    }

    #[test]
    fn perspective_roundtrips_through_inverse() {
        let h = Homography::new(Matrix3::new(
            1.1, 0.02, 8.0, //
            -0.03, 0.95, 4.0, //
            0.0002, 0.0001, 1.0,
        ));
        let inv = h.inverse().expect("invertible");

        let quad = Quad::page(320.0, 240.0);
        let back = quad.perspective(&h).perspective(&inv);
        for i in 0..4 {
            let a = quad.vertex(i);
            let b = back.vertex(i);
            assert!((a - b).norm() < 1e-6, "vertex {i}: {a:?} vs {b:?}");
        }
    }

    #[test]
    fn missing_homography_sinks_the_quad() {
        let quad = Quad::page(320.0, 240.0);
        let sunk = quad_perspective(&quad, None);
        assert_eq!(sunk.area(), 0.0);
    }

    #[test]
    fn deviation_separates_translation_from_deformation() {
        let quad = Quad::page(100.0, 100.0);
        let shifted = Quad::new(8.0, 6.0, 8.0, 106.0, 108.0, 106.0, 108.0, 6.0);
        let (dev, def) = deviation(&quad, &shifted);
        assert!((dev - 10.0).abs() < 1e-9);
        assert!(def.abs() < 1e-9);

        // Moving one corner by (8, 0) leaves a 6-pixel residual on that
        // corner and a 2-pixel deviation overall.
        let bent = Quad::new(8.0, 0.0, 0.0, 100.0, 100.0, 100.0, 100.0, 0.0);
        let (dev, def) = deviation(&quad, &bent);
        assert!((dev - 2.0).abs() < 1e-9);
        assert!((def - 6.0).abs() < 1e-9);
    }
}
