//! Iso-surface extraction by marching tetrahedra.
//!
//! Every lattice cell is split into six tetrahedra around its main diagonal.
//! All cells share the same split, so neighbouring cells agree on their
//! shared faces and the surface has no cracks. Edge crossings are shared
//! between triangles, giving an indexed mesh.

use std::collections::HashMap;

use ndarray::{Array3, s};
use tracing::debug;

use crate::{
    mesh::{TriangleMesh, face_normal_unnormalized},
    volume::VoxelSpacing,
};

/// Cell corners as (dz, dy, dx).
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [0, 0, 1],
    [0, 1, 1],
    [0, 1, 0],
    [1, 0, 0],
    [1, 0, 1],
    [1, 1, 1],
    [1, 1, 0],
];

/// Six tetrahedra sharing the 0-6 diagonal.
const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 5, 1, 6],
    [0, 1, 2, 6],
    [0, 2, 3, 6],
    [0, 3, 7, 6],
    [0, 7, 4, 6],
    [0, 4, 5, 6],
];

struct Extractor<'a> {
    field: &'a Array3<f32>,
    level: f32,
    spacing: VoxelSpacing,
    edge_vertices: HashMap<(usize, usize), u32>,
    vertices: Vec<[f32; 3]>,
    faces: Vec<[u32; 3]>,
}

impl Extractor<'_> {
    fn linear(&self, [z, y, x]: [usize; 3]) -> usize {
        let (_, height, width) = self.field.dim();
        (z * height + y) * width + x
    }

    fn position(&self, [z, y, x]: [usize; 3]) -> [f32; 3] {
        [
            x as f32 * self.spacing.x,
            y as f32 * self.spacing.y,
            z as f32 * self.spacing.z,
        ]
    }

    /// Vertex where the surface crosses the edge a-b, created once per edge.
    fn edge_vertex(&mut self, a: [usize; 3], b: [usize; 3]) -> u32 {
        let (ia, ib) = (self.linear(a), self.linear(b));
        let key = if ia < ib { (ia, ib) } else { (ib, ia) };
        if let Some(&index) = self.edge_vertices.get(&key) {
            return index;
        }
        let (va, vb) = (self.field[a], self.field[b]);
        let t = ((self.level - va) / (vb - va)).clamp(0.0, 1.0);
        let (pa, pb) = (self.position(a), self.position(b));
        let p = [
            t.mul_add(pb[0] - pa[0], pa[0]),
            t.mul_add(pb[1] - pa[1], pa[1]),
            t.mul_add(pb[2] - pa[2], pa[2]),
        ];
        let index = self.vertices.len() as u32;
        self.vertices.push(p);
        self.edge_vertices.insert(key, index);
        index
    }

    /// Emit a triangle facing away from `inside_centroid`.
    fn triangle(&mut self, mut tri: [u32; 3], inside_centroid: [f32; 3]) {
        if tri[0] == tri[1] || tri[1] == tri[2] || tri[0] == tri[2] {
            return;
        }
        let [a, b, c] = tri.map(|i| self.vertices[i as usize]);
        let n = face_normal_unnormalized(a, b, c);
        if n[0] == 0.0 && n[1] == 0.0 && n[2] == 0.0 {
            return;
        }
        let centroid = [
            (a[0] + b[0] + c[0]) / 3.0,
            (a[1] + b[1] + c[1]) / 3.0,
            (a[2] + b[2] + c[2]) / 3.0,
        ];
        let outward = (centroid[0] - inside_centroid[0]) * n[0]
            + (centroid[1] - inside_centroid[1]) * n[1]
            + (centroid[2] - inside_centroid[2]) * n[2];
        if outward < 0.0 {
            tri.swap(1, 2);
        }
        self.faces.push(tri);
    }

    fn centroid(&self, points: &[[usize; 3]]) -> [f32; 3] {
        let n = points.len() as f32;
        points.iter().fold([0.0_f32; 3], |acc, &p| {
            let q = self.position(p);
            [acc[0] + q[0] / n, acc[1] + q[1] / n, acc[2] + q[2] / n]
        })
    }

    fn tetrahedron(&mut self, points: [[usize; 3]; 4]) {
        let (inside, outside): (Vec<[usize; 3]>, Vec<[usize; 3]>) = points
            .into_iter()
            .partition(|p| self.field[*p] > self.level);

        match (inside.as_slice(), outside.as_slice()) {
            ([a], [b, c, d]) => {
                let centroid = self.position(*a);
                let tri = [
                    self.edge_vertex(*a, *b),
                    self.edge_vertex(*a, *c),
                    self.edge_vertex(*a, *d),
                ];
                self.triangle(tri, centroid);
            }
            ([b, c, d], [a]) => {
                let centroid = self.centroid(&inside);
                let tri = [
                    self.edge_vertex(*a, *b),
                    self.edge_vertex(*a, *c),
                    self.edge_vertex(*a, *d),
                ];
                self.triangle(tri, centroid);
            }
            ([a, b], [c, d]) => {
                let centroid = self.centroid(&inside);
                let ac = self.edge_vertex(*a, *c);
                let ad = self.edge_vertex(*a, *d);
                let bd = self.edge_vertex(*b, *d);
                let bc = self.edge_vertex(*b, *c);
                self.triangle([ac, ad, bd], centroid);
                self.triangle([ac, bd, bc], centroid);
            }
            _ => {}
        }
    }
}

/// Extract the surface where `field` crosses `level`.
///
/// Vertices are in physical (x, y, z) order scaled by `spacing`; the field is
/// indexed (z, y, x). Triangles face away from values above `level`.
pub fn extract(field: &Array3<f32>, level: f32, spacing: VoxelSpacing) -> TriangleMesh {
    let (depth, height, width) = field.dim();
    let mut extractor = Extractor {
        field,
        level,
        spacing,
        edge_vertices: HashMap::new(),
        vertices: Vec::new(),
        faces: Vec::new(),
    };
    if depth < 2 || height < 2 || width < 2 {
        return TriangleMesh::default();
    }

    for z in 0..depth - 1 {
        for y in 0..height - 1 {
            for x in 0..width - 1 {
                let corners = CORNERS.map(|[dz, dy, dx]| [z + dz, y + dy, x + dx]);
                let values = corners.map(|c| field[c] > level);
                if values.iter().all(|&v| v) || values.iter().all(|&v| !v) {
                    continue;
                }
                for tet in TETRAHEDRA {
                    extractor.tetrahedron(tet.map(|i| corners[i]));
                }
            }
        }
    }

    debug!(
        vertices = extractor.vertices.len(),
        faces = extractor.faces.len(),
        "Extracted iso-surface"
    );
    TriangleMesh::new(extractor.vertices, extractor.faces)
}

/// Like [`extract`], but pads the field with one layer below `level` so
/// surfaces touching the grid border close. Coordinates stay those of the
/// unpadded grid.
pub fn extract_closed(field: &Array3<f32>, level: f32, spacing: VoxelSpacing) -> TriangleMesh {
    let (depth, height, width) = field.dim();
    let background = match crate::filters::min_max(field.iter().copied()) {
        Some((lo, _)) if lo < level => lo,
        _ => level - 1.0,
    };
    let mut padded = Array3::from_elem((depth + 2, height + 2, width + 2), background);
    padded
        .slice_mut(s![1..=depth, 1..=height, 1..=width])
        .assign(field);

    let mut mesh = extract(&padded, level, spacing);
    for v in &mut mesh.vertices {
        v[0] -= spacing.x;
        v[1] -= spacing.y;
        v[2] -= spacing.z;
    }
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sphere(n: usize, radius: f32) -> Array3<f32> {
        let c = (n as f32 - 1.0) / 2.0;
        Array3::from_shape_fn((n, n, n), |(z, y, x)| {
            let d = ((z as f32 - c).powi(2) + (y as f32 - c).powi(2) + (x as f32 - c).powi(2)).sqrt();
            radius - d
        })
    }

    #[test]
    fn sphere_vertices_lie_on_the_level_set() {
        let mesh = extract(&sphere(16, 5.0), 0.0, VoxelSpacing::default());
        assert!(mesh.face_count() > 100);
        let c = 7.5;
        for v in &mesh.vertices {
            let d = ((v[0] - c).powi(2) + (v[1] - c).powi(2) + (v[2] - c).powi(2)).sqrt();
            assert!((d - 5.0).abs() < 0.15, "vertex at distance {d}");
        }
    }

    #[test]
    fn surface_is_closed_and_outward() {
        let mesh = extract(&sphere(12, 3.5), 0.0, VoxelSpacing::default());
        let mut edges: HashMap<(u32, u32), i32> = HashMap::new();
        for f in &mesh.faces {
            for i in 0..3 {
                *edges.entry((f[i], f[(i + 1) % 3])).or_default() += 1;
            }
        }
        // Every directed edge is matched by its reverse in a closed, consistently wound surface.
        for (&(a, b), &count) in &edges {
            assert_eq!(count, 1);
            assert_eq!(edges.get(&(b, a)), Some(&1));
        }
        let c = 5.5;
        for (v, n) in mesh.vertices.iter().zip(&mesh.normals) {
            let radial = [v[0] - c, v[1] - c, v[2] - c];
            assert!(radial[0] * n[0] + radial[1] * n[1] + radial[2] * n[2] > 0.0);
        }
    }

    #[test]
    fn spacing_scales_coordinates() {
        let field = Array3::from_shape_fn((2, 2, 2), |(z, _, _)| z as f32);
        let mesh = extract(&field, 0.5, VoxelSpacing::new(4.0, 1.0, 2.0));
        assert!(!mesh.is_empty());
        for v in &mesh.vertices {
            assert_relative_eq!(v[2], 2.0);
            assert!(v[0] <= 2.0 && v[1] <= 1.0);
        }
    }

    #[test]
    fn border_touching_block_is_closed_by_padding() {
        let field = Array3::from_elem((3, 3, 3), 1.0);
        assert!(extract(&field, 0.5, VoxelSpacing::default()).is_empty());
        let mesh = extract_closed(&field, 0.5, VoxelSpacing::default());
        let (lo, hi) = mesh.bounds().unwrap();
        for axis in 0..3 {
            assert!(lo[axis] < 0.0 && lo[axis] > -1.0);
            assert!(hi[axis] > 2.0 && hi[axis] < 3.0);
        }
    }
}
