//! Quadric error metric.
//!
//! A quadric accumulates squared distances to a set of planes. Summing the
//! quadrics of two vertices gives the cost of merging them at a point.

use std::ops::AddAssign;

/// Symmetric 4x4 matrix kept as its upper triangle:
///
/// ```text
/// [0 1 2 3]
/// [  4 5 6]
/// [    7 8]
/// [      9]
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quadric([f64; 10]);

impl Quadric {
    /// Quadric of the plane `ax + by + cz + d = 0` with unit normal (a, b, c).
    #[must_use]
    pub fn from_plane(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self([
            a * a,
            a * b,
            a * c,
            a * d,
            b * b,
            b * c,
            b * d,
            c * c,
            c * d,
            d * d,
        ])
    }

    /// Quadric of the plane through a triangle, `None` if it is degenerate.
    #[must_use]
    pub fn from_triangle(p0: [f64; 3], p1: [f64; 3], p2: [f64; 3]) -> Option<Self> {
        let e1 = [p1[0] - p0[0], p1[1] - p0[1], p1[2] - p0[2]];
        let e2 = [p2[0] - p0[0], p2[1] - p0[1], p2[2] - p0[2]];
        let n = [
            e1[1].mul_add(e2[2], -e1[2] * e2[1]),
            e1[2].mul_add(e2[0], -e1[0] * e2[2]),
            e1[0].mul_add(e2[1], -e1[1] * e2[0]),
        ];
        let len = n[0].mul_add(n[0], n[1].mul_add(n[1], n[2] * n[2])).sqrt();
        if len < 1e-12 {
            return None;
        }
        let [a, b, c] = n.map(|v| v / len);
        let d = -a.mul_add(p0[0], b.mul_add(p0[1], c * p0[2]));
        Some(Self::from_plane(a, b, c, d))
    }

    /// Sum of squared distances from `p` to the accumulated planes.
    #[must_use]
    pub fn evaluate(&self, [x, y, z]: [f64; 3]) -> f64 {
        let q = &self.0;
        x * x * q[0]
            + 2.0 * x * y * q[1]
            + 2.0 * x * z * q[2]
            + 2.0 * x * q[3]
            + y * y * q[4]
            + 2.0 * y * z * q[5]
            + 2.0 * y * q[6]
            + z * z * q[7]
            + 2.0 * z * q[8]
            + q[9]
    }

    /// Point of minimum error, `None` when the 3x3 system is singular.
    #[must_use]
    pub fn optimal_point(&self) -> Option<[f64; 3]> {
        let q = &self.0;
        let m = [[q[0], q[1], q[2]], [q[1], q[4], q[5]], [q[2], q[5], q[7]]];
        let rhs = [-q[3], -q[6], -q[8]];

        let det3 = |m: [[f64; 3]; 3]| {
            m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
                - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
                + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
        };
        let det = det3(m);
        if det.abs() < 1e-10 {
            return None;
        }

        // Cramer's rule.
        let mut point = [0.0; 3];
        for (col, out) in point.iter_mut().enumerate() {
            let mut replaced = m;
            for row in 0..3 {
                replaced[row][col] = rhs[row];
            }
            *out = det3(replaced) / det;
        }
        Some(point)
    }
}

impl AddAssign for Quadric {
    fn add_assign(&mut self, other: Self) {
        self.0.iter_mut().zip(other.0).for_each(|(a, b)| *a += b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn distance_to_plane_is_squared() {
        let q = Quadric::from_plane(0.0, 0.0, 1.0, 0.0);
        assert_relative_eq!(q.evaluate([3.0, -2.0, 0.0]), 0.0);
        assert_relative_eq!(q.evaluate([0.0, 0.0, 2.0]), 4.0);
    }

    #[test]
    fn three_planes_meet_at_their_corner() {
        let mut q = Quadric::from_plane(1.0, 0.0, 0.0, -1.0);
        q += Quadric::from_plane(0.0, 1.0, 0.0, -2.0);
        q += Quadric::from_plane(0.0, 0.0, 1.0, -3.0);
        let p = q.optimal_point().unwrap();
        assert_relative_eq!(p[0], 1.0, epsilon = 1e-9);
        assert_relative_eq!(p[1], 2.0, epsilon = 1e-9);
        assert_relative_eq!(p[2], 3.0, epsilon = 1e-9);
        assert_relative_eq!(q.evaluate(p), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn single_plane_is_singular() {
        let q = Quadric::from_plane(0.0, 1.0, 0.0, 0.0);
        assert!(q.optimal_point().is_none());
    }

    #[test]
    fn degenerate_triangle_has_no_plane() {
        assert!(Quadric::from_triangle([0.0; 3], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]).is_none());
        let q = Quadric::from_triangle([0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]).unwrap();
        assert_relative_eq!(q.evaluate([5.0, 5.0, 1.0]), 1.0);
    }
}
