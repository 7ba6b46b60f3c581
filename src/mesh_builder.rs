use ndarray::Array3;
use tracing::{debug, info, warn};

use crate::{
    config::MeshParams,
    decimate::{DecimateParams, decimate_mesh},
    enums::Neighborhood,
    error::{Error, Result},
    filters::gaussian_smooth,
    isosurface,
    mesh::TriangleMesh,
    morphology::{self, StructuringElement},
    smoothing::smooth_laplacian_iterations,
    volume::VoxelSpacing,
};

/// Turns a boolean tissue mask into a cleaned, smoothed, simplified surface.
pub struct VolumetricMeshBuilder {
    params: MeshParams,
}

impl VolumetricMeshBuilder {
    pub fn new(params: MeshParams) -> Self {
        Self { params }
    }

    /// Build the surface of `mask` in physical coordinates.
    ///
    /// Smoothing and simplification failures are logged and the coarser mesh
    /// is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoGeometry`] when the mask has too few voxels before
    /// or after cleanup, or yields no surface.
    pub fn build(
        &self,
        mask: &Array3<bool>,
        spacing: VoxelSpacing,
        target_faces: usize,
        keep_small_objects: bool,
    ) -> Result<TriangleMesh> {
        let p = &self.params;
        let voxels = morphology::count(mask);
        if voxels < p.min_voxels {
            return Err(Error::NoGeometry(format!("only {voxels} voxels in mask")));
        }

        let cleaned = self.clean_mask(mask, keep_small_objects);
        let remaining = morphology::count(&cleaned);
        if remaining < p.min_voxels {
            return Err(Error::NoGeometry(format!(
                "only {remaining} voxels remain after cleanup"
            )));
        }
        debug!(voxels, remaining, "Cleaned tissue mask");

        let field = gaussian_smooth(
            &cleaned.mapv(|v| if v { 1.0 } else { 0.0 }),
            p.sigma,
            Neighborhood::Volumetric,
        );
        let mut mesh = isosurface::extract_closed(&field, p.iso_level, spacing);
        if mesh.is_empty() {
            return Err(Error::NoGeometry("iso-surface is empty".to_string()));
        }
        let extracted = mesh.face_count();

        if p.laplacian_iterations > 0 {
            match smooth_laplacian_iterations(&mesh, p.laplacian_iterations, p.laplacian_lambda) {
                Ok(result) => mesh = result.mesh,
                Err(err) => warn!(%err, "Laplacian smoothing failed, keeping unsmoothed mesh"),
            }
        }

        if mesh.face_count() > target_faces {
            match decimate_mesh(&mesh, &DecimateParams::with_target_triangles(target_faces)) {
                Ok(result) => mesh = result.mesh,
                Err(err) => warn!(%err, "Simplification failed, keeping full mesh"),
            }
        }

        info!(
            voxels = remaining,
            extracted,
            faces = mesh.face_count(),
            target = target_faces,
            "Built tissue mesh"
        );
        Ok(mesh)
    }

    /// Opening (large masks only), closing, hole filling, then pruning of
    /// small components unless `keep_small_objects`.
    pub fn clean_mask(&self, mask: &Array3<bool>, keep_small_objects: bool) -> Array3<bool> {
        let p = &self.params;
        let element = StructuringElement::cross(Neighborhood::Volumetric);
        let voxels = morphology::count(mask);

        let mut cleaned = if voxels > p.opening_min_voxels {
            morphology::opening(mask, &element)
        } else {
            mask.clone()
        };
        cleaned = morphology::closing(&cleaned, &element);
        cleaned = morphology::fill_holes(&cleaned, Neighborhood::Volumetric);

        if !keep_small_objects {
            let components = morphology::label_components(&cleaned, Neighborhood::Volumetric);
            if components.sizes.len() > 1 {
                let largest = components.largest();
                let min_size = p
                    .min_voxels
                    .max((largest as f64 * p.small_component_fraction).ceil() as usize);
                cleaned = morphology::remove_small_components(&cleaned, &components, min_size);
                debug!(
                    components = components.sizes.len(),
                    largest,
                    min_size,
                    "Pruned small components"
                );
            }
        }
        cleaned
    }
}

impl Default for VolumetricMeshBuilder {
    fn default() -> Self {
        Self::new(MeshParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(dim: usize, lo: usize, hi: usize) -> Array3<bool> {
        Array3::from_shape_fn((dim, dim, dim), |(z, y, x)| {
            [z, y, x].iter().all(|c| (lo..hi).contains(c))
        })
    }

    #[test]
    fn three_voxels_are_no_geometry() {
        let mut mask = Array3::from_elem((8, 8, 8), false);
        mask[[4, 4, 4]] = true;
        mask[[4, 4, 5]] = true;
        mask[[4, 5, 4]] = true;
        let result = VolumetricMeshBuilder::default().build(&mask, VoxelSpacing::default(), 1000, true);
        assert!(matches!(result, Err(Error::NoGeometry(_))));
    }

    #[test]
    fn block_becomes_a_closed_mesh_within_budget() {
        let mask = block(20, 4, 16);
        let spacing = VoxelSpacing::new(2.0, 1.0, 1.0);
        let mesh = VolumetricMeshBuilder::default()
            .build(&mask, spacing, 300, false)
            .unwrap();
        assert!(!mesh.is_empty());
        assert!(mesh.face_count() <= 300);
        assert_eq!(mesh.normals.len(), mesh.vertex_count());

        // z extent is stretched by the z spacing.
        let (lo, hi) = mesh.bounds().unwrap();
        let extent = [hi[0] - lo[0], hi[1] - lo[1], hi[2] - lo[2]];
        assert!(extent[2] > 1.5 * extent[0]);
        assert!(extent[0] > 8.0 && extent[0] < 14.0);
    }

    #[test]
    fn specks_are_pruned_unless_kept() {
        let mut mask = block(24, 2, 14);
        mask[[20, 20, 20]] = true;
        let builder = VolumetricMeshBuilder::default();

        let pruned = builder.clean_mask(&mask, false);
        assert!(!pruned[[20, 20, 20]]);
        assert!(pruned[[8, 8, 8]]);

        let kept = builder.clean_mask(&mask, true);
        assert!(kept[[20, 20, 20]]);
        assert_eq!(morphology::count(&kept), morphology::count(&pruned) + 1);
    }
}
