//! Edge-collapse simplification driven by quadric error.
//!
//! Vertices keep a list of incident faces and a version counter. Heap entries
//! remember the versions they were computed against, so stale entries are
//! skipped when popped instead of being searched for and removed.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
};

use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    mesh::TriangleMesh,
    quadric::Quadric,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecimateParams {
    pub target_triangles: usize,
    /// Skip collapses that would turn any surviving face over.
    pub prevent_flips: bool,
    pub max_error: Option<f64>,
}

impl DecimateParams {
    #[must_use]
    pub fn with_target_triangles(count: usize) -> Self {
        Self {
            target_triangles: count,
            prevent_flips: true,
            max_error: None,
        }
    }

    #[must_use]
    pub fn with_max_error(mut self, max_error: f64) -> Self {
        self.max_error = Some(max_error);
        self
    }
}

#[derive(Debug, Clone)]
pub struct DecimationResult {
    pub mesh: TriangleMesh,
    pub original_triangles: usize,
    pub final_triangles: usize,
    pub collapses_performed: usize,
    pub collapses_rejected: usize,
}

#[derive(Debug, Clone)]
struct EdgeCollapse {
    v1: u32,
    v2: u32,
    versions: (u32, u32),
    cost: f64,
    target: [f64; 3],
}

impl PartialEq for EdgeCollapse {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}

impl Eq for EdgeCollapse {}

impl PartialOrd for EdgeCollapse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EdgeCollapse {
    // Reversed so the BinaryHeap pops the cheapest collapse first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.total_cmp(&self.cost)
    }
}

struct Decimator {
    positions: Vec<[f64; 3]>,
    vertex_alive: Vec<bool>,
    versions: Vec<u32>,
    quadrics: Vec<Quadric>,
    faces: Vec<[u32; 3]>,
    face_alive: Vec<bool>,
    vertex_faces: Vec<Vec<usize>>,
    active_faces: usize,
}

impl Decimator {
    fn new(mesh: &TriangleMesh) -> Self {
        let positions: Vec<[f64; 3]> = mesh
            .vertices
            .iter()
            .map(|v| v.map(f64::from))
            .collect();
        let mut quadrics = vec![Quadric::default(); positions.len()];
        let mut vertex_faces = vec![Vec::new(); positions.len()];
        for (fi, face) in mesh.faces.iter().enumerate() {
            let [a, b, c] = face.map(|i| positions[i as usize]);
            let plane = Quadric::from_triangle(a, b, c);
            for &vi in face {
                if let Some(q) = plane {
                    quadrics[vi as usize] += q;
                }
                vertex_faces[vi as usize].push(fi);
            }
        }
        Self {
            vertex_alive: vec![true; positions.len()],
            versions: vec![0; positions.len()],
            positions,
            quadrics,
            faces: mesh.faces.clone(),
            face_alive: vec![true; mesh.faces.len()],
            vertex_faces,
            active_faces: mesh.faces.len(),
        }
    }

    fn live_faces(&self, v: u32) -> impl Iterator<Item = usize> + '_ {
        self.vertex_faces[v as usize]
            .iter()
            .copied()
            .filter(|&f| self.face_alive[f])
    }

    fn neighbors(&self, v: u32) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .live_faces(v)
            .flat_map(|f| self.faces[f])
            .filter(|&n| n != v)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collapse_candidate(&self, v1: u32, v2: u32) -> EdgeCollapse {
        let mut combined = self.quadrics[v1 as usize];
        combined += self.quadrics[v2 as usize];
        let p1 = self.positions[v1 as usize];
        let p2 = self.positions[v2 as usize];
        let midpoint = [
            f64::midpoint(p1[0], p2[0]),
            f64::midpoint(p1[1], p2[1]),
            f64::midpoint(p1[2], p2[2]),
        ];

        // Guard against ill-conditioned solutions far from the edge.
        let edge_len_sq = (0..3).map(|i| (p2[i] - p1[i]).powi(2)).sum::<f64>();
        let optimal = combined.optimal_point().filter(|p| {
            let d = (0..3).map(|i| (p[i] - midpoint[i]).powi(2)).sum::<f64>();
            d <= 4.0 * edge_len_sq.max(1e-12)
        });
        let (target, cost) = optimal
            .into_iter()
            .chain([midpoint, p1, p2])
            .map(|p| (p, combined.evaluate(p)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((midpoint, f64::INFINITY));

        EdgeCollapse {
            v1,
            v2,
            versions: (self.versions[v1 as usize], self.versions[v2 as usize]),
            cost,
            target,
        }
    }

    fn is_stale(&self, c: &EdgeCollapse) -> bool {
        !self.vertex_alive[c.v1 as usize]
            || !self.vertex_alive[c.v2 as usize]
            || self.versions[c.v1 as usize] != c.versions.0
            || self.versions[c.v2 as usize] != c.versions.1
    }

    /// Link condition: the endpoints share exactly the two opposite vertices
    /// of the edge's faces (or one on a boundary).
    fn keeps_manifold(&self, v1: u32, v2: u32) -> bool {
        let n1 = self.neighbors(v1);
        let n2 = self.neighbors(v2);
        let shared = n1.iter().filter(|n| n2.binary_search(n).is_ok()).count();
        let edge_faces = self
            .live_faces(v1)
            .filter(|&f| self.faces[f].contains(&v2))
            .count();
        edge_faces > 0 && shared <= 2 && shared == edge_faces
    }

    /// Would moving both endpoints to `target` turn a surviving face over?
    fn flips(&self, v1: u32, v2: u32, target: [f64; 3]) -> bool {
        [v1, v2].into_iter().any(|v| {
            self.live_faces(v).any(|f| {
                let face = self.faces[f];
                if face.contains(&v1) && face.contains(&v2) {
                    return false;
                }
                let old = face.map(|i| self.positions[i as usize]);
                let new = face.map(|i| {
                    if i == v1 || i == v2 {
                        target
                    } else {
                        self.positions[i as usize]
                    }
                });
                let n_old = normal(old);
                let n_new = normal(new);
                n_old[0] * n_new[0] + n_old[1] * n_new[1] + n_old[2] * n_new[2] <= 0.0
            })
        })
    }

    /// Merge `v2` into `v1` at `target`.
    fn collapse(&mut self, v1: u32, v2: u32, target: [f64; 3]) {
        self.positions[v1 as usize] = target;
        let q2 = self.quadrics[v2 as usize];
        self.quadrics[v1 as usize] += q2;
        self.vertex_alive[v2 as usize] = false;
        self.versions[v1 as usize] += 1;
        self.versions[v2 as usize] += 1;

        let moved = std::mem::take(&mut self.vertex_faces[v2 as usize]);
        for f in moved {
            if !self.face_alive[f] {
                continue;
            }
            if self.faces[f].contains(&v1) {
                self.face_alive[f] = false;
                self.active_faces -= 1;
            } else {
                for idx in &mut self.faces[f] {
                    if *idx == v2 {
                        *idx = v1;
                    }
                }
                self.vertex_faces[v1 as usize].push(f);
            }
        }
        let alive = &self.face_alive;
        self.vertex_faces[v1 as usize].retain(|&f| alive[f]);
    }

    fn into_mesh(self) -> TriangleMesh {
        let faces = self
            .faces
            .iter()
            .zip(&self.face_alive)
            .filter(|&(_, &alive)| alive)
            .map(|(f, _)| *f)
            .collect();
        let vertices = self
            .positions
            .iter()
            .map(|p| p.map(|c| c as f32))
            .collect();
        let mut mesh = TriangleMesh {
            vertices,
            faces,
            normals: Vec::new(),
        };
        mesh.compact();
        mesh
    }
}

fn normal(p: [[f64; 3]; 3]) -> [f64; 3] {
    let e1 = [p[1][0] - p[0][0], p[1][1] - p[0][1], p[1][2] - p[0][2]];
    let e2 = [p[2][0] - p[0][0], p[2][1] - p[0][1], p[2][2] - p[0][2]];
    [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ]
}

/// Simplify `mesh` toward `params.target_triangles` faces.
///
/// The face count never grows. It may stay above the target when no valid
/// collapse remains.
///
/// # Errors
///
/// Returns [`Error::NoGeometry`] if simplification collapsed every face;
/// callers keep the input mesh.
pub fn decimate_mesh(mesh: &TriangleMesh, params: &DecimateParams) -> Result<DecimationResult> {
    let original_triangles = mesh.face_count();
    let target = params.target_triangles;
    if original_triangles <= target {
        return Ok(DecimationResult {
            mesh: mesh.clone(),
            original_triangles,
            final_triangles: original_triangles,
            collapses_performed: 0,
            collapses_rejected: 0,
        });
    }

    info!(original = original_triangles, target, "Starting mesh decimation");

    let mut state = Decimator::new(mesh);
    let mut heap = BinaryHeap::new();
    let mut seen_edges = HashSet::new();
    for face in &mesh.faces {
        for i in 0..3 {
            let (a, b) = (face[i], face[(i + 1) % 3]);
            if seen_edges.insert((a.min(b), a.max(b))) {
                heap.push(state.collapse_candidate(a, b));
            }
        }
    }

    let mut collapses_performed = 0;
    let mut collapses_rejected = 0;

    while state.active_faces > target {
        let Some(candidate) = heap.pop() else {
            break;
        };
        if state.is_stale(&candidate) {
            continue;
        }
        let (v1, v2) = (candidate.v1, candidate.v2);

        if params.max_error.is_some_and(|max| candidate.cost > max)
            || !state.keeps_manifold(v1, v2)
            || (params.prevent_flips && state.flips(v1, v2, candidate.target))
        {
            collapses_rejected += 1;
            continue;
        }

        state.collapse(v1, v2, candidate.target);
        collapses_performed += 1;

        for n in state.neighbors(v1) {
            heap.push(state.collapse_candidate(v1, n));
        }
    }

    let final_triangles = state.active_faces;
    if final_triangles == 0 {
        return Err(Error::NoGeometry("decimation removed every face".to_string()));
    }
    let result = state.into_mesh();
    if result.vertices.iter().flatten().any(|c| !c.is_finite()) {
        return Err(Error::NoGeometry(
            "decimation produced non-finite vertices".to_string(),
        ));
    }

    info!(
        final_triangles,
        collapses = collapses_performed,
        rejected = collapses_rejected,
        "Decimation complete"
    );
    debug!(vertices = result.vertex_count(), "Decimated mesh compacted");

    Ok(DecimationResult {
        mesh: result,
        original_triangles,
        final_triangles,
        collapses_performed,
        collapses_rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{isosurface, volume::VoxelSpacing};
    use ndarray::Array3;

    fn sphere_mesh() -> TriangleMesh {
        let n = 20;
        let c = (n as f32 - 1.0) / 2.0;
        let field = Array3::from_shape_fn((n, n, n), |(z, y, x)| {
            7.0 - ((z as f32 - c).powi(2) + (y as f32 - c).powi(2) + (x as f32 - c).powi(2)).sqrt()
        });
        isosurface::extract(&field, 0.0, VoxelSpacing::default())
    }

    #[test]
    fn reduces_to_target_without_growing() {
        let mesh = sphere_mesh();
        let original = mesh.face_count();
        assert!(original > 1000);

        let result = decimate_mesh(&mesh, &DecimateParams::with_target_triangles(500)).unwrap();
        assert_eq!(result.original_triangles, original);
        assert!(result.final_triangles <= original);
        assert!(result.final_triangles <= 500);
        assert_eq!(result.mesh.face_count(), result.final_triangles);
        assert!(result.collapses_performed > 0);
    }

    #[test]
    fn decimated_sphere_keeps_its_size() {
        let result =
            decimate_mesh(&sphere_mesh(), &DecimateParams::with_target_triangles(400)).unwrap();
        let c = 9.5;
        for v in &result.mesh.vertices {
            let d = ((v[0] - c).powi(2) + (v[1] - c).powi(2) + (v[2] - c).powi(2)).sqrt();
            assert!((d - 7.0).abs() < 1.0, "vertex drifted to radius {d}");
        }
    }

    #[test]
    fn small_mesh_is_returned_unchanged() {
        let mesh = TriangleMesh::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0, 1, 2]],
        );
        let result = decimate_mesh(&mesh, &DecimateParams::with_target_triangles(10)).unwrap();
        assert_eq!(result.mesh, mesh);
        assert_eq!(result.collapses_performed, 0);
    }
}
