//! Laplacian mesh smoothing.
//!
//! Each vertex moves toward the centroid of its neighbours:
//!
//! ```text
//! v_new = v + lambda * (centroid(N(v)) - v)
//! ```
//!
//! Repeated passes shrink the mesh, so only a couple are applied.

use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    mesh::TriangleMesh,
};

/// Result of Laplacian smoothing.
#[derive(Debug, Clone)]
pub struct LaplacianResult {
    pub mesh: TriangleMesh,
    pub iterations_performed: u32,
    /// Largest single vertex displacement across all iterations.
    pub max_displacement: f32,
}

/// One smoothing pass. Returns the new mesh and the largest displacement.
pub fn smooth_laplacian(mesh: &TriangleMesh, lambda: f32) -> (TriangleMesh, f32) {
    if mesh.vertices.is_empty() || mesh.faces.is_empty() {
        return (mesh.clone(), 0.0);
    }
    let neighbors = build_vertex_neighbors(mesh);

    let moved: Vec<([f32; 3], f32)> = mesh
        .vertices
        .par_iter()
        .zip(neighbors.par_iter())
        .map(|(&v, adjacent)| {
            if adjacent.is_empty() {
                return (v, 0.0);
            }
            let n = adjacent.len() as f32;
            let sum = adjacent.iter().fold([0.0_f32; 3], |acc, &i| {
                let p = mesh.vertices[i as usize];
                [acc[0] + p[0], acc[1] + p[1], acc[2] + p[2]]
            });
            let d = [
                (sum[0] / n - v[0]) * lambda,
                (sum[1] / n - v[1]) * lambda,
                (sum[2] / n - v[2]) * lambda,
            ];
            let dist = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
            ([v[0] + d[0], v[1] + d[1], v[2] + d[2]], dist)
        })
        .collect();

    let max_displacement = moved.iter().map(|&(_, d)| d).fold(0.0, f32::max);
    let mut result = mesh.clone();
    result.vertices = moved.into_iter().map(|(p, _)| p).collect();
    (result, max_displacement)
}

/// Several passes, recomputing normals at the end.
///
/// # Errors
///
/// Returns [`Error::NoGeometry`] if smoothing produced non-finite
/// coordinates; callers keep the unsmoothed mesh.
pub fn smooth_laplacian_iterations(
    mesh: &TriangleMesh,
    iterations: u32,
    lambda: f32,
) -> Result<LaplacianResult> {
    let mut current = mesh.clone();
    let mut max_displacement = 0.0_f32;
    for _ in 0..iterations {
        let (smoothed, iter_max) = smooth_laplacian(&current, lambda);
        max_displacement = max_displacement.max(iter_max);
        current = smoothed;
    }
    if current.vertices.iter().flatten().any(|c| !c.is_finite()) {
        return Err(Error::NoGeometry(
            "smoothing produced non-finite vertices".to_string(),
        ));
    }
    current.compute_vertex_normals();
    Ok(LaplacianResult {
        mesh: current,
        iterations_performed: iterations,
        max_displacement,
    })
}

/// Sorted, deduplicated neighbour lists per vertex.
fn build_vertex_neighbors(mesh: &TriangleMesh) -> Vec<Vec<u32>> {
    let mut neighbors: Vec<Vec<u32>> = vec![Vec::new(); mesh.vertices.len()];
    for face in &mesh.faces {
        for i in 0..3 {
            let v = face[i] as usize;
            neighbors[v].push(face[(i + 1) % 3]);
            neighbors[v].push(face[(i + 2) % 3]);
        }
    }
    for list in &mut neighbors {
        list.sort_unstable();
        list.dedup();
    }
    neighbors
}
