//! Multi-tissue scene assembly and the model manifest.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::{MIN_MODEL_EXTENT, MIN_MODEL_SLICES, MeshParams, SegmentationParams},
    enums::TissueKind,
    error::{Error, Result},
    interpolator::Interpolator,
    mesh::MeshArtifact,
    mesh_builder::VolumetricMeshBuilder,
    segmentation::TissueSegmenter,
    volume::{Volume, VoxelSpacing},
};

/// Display attributes of one tissue in a model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TissueInfo {
    pub name: String,
    /// `#RRGGBB`
    pub color: String,
    pub opacity: f32,
}

impl From<&MeshArtifact> for TissueInfo {
    fn from(artifact: &MeshArtifact) -> Self {
        Self {
            name: artifact.name().to_string(),
            color: artifact.color.to_hex(),
            opacity: artifact.opacity,
        }
    }
}

/// Describes a generated model and where its scene was exported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub series_id: String,
    pub tissues: Vec<TissueInfo>,
    pub slice_count: usize,
    /// Meshed grid shape (z, y, x).
    pub dimensions: [usize; 3],
    /// Meshed grid spacing (z, y, x) in mm.
    pub voxel_spacing: [f32; 3],
    #[serde(default)]
    pub glb_path: Option<String>,
}

/// Short listing entry for a model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub series_id: String,
    pub tissues: Vec<String>,
    pub slice_count: usize,
}

/// Axial plane through the model at one slice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlicePlane {
    pub slice_index: usize,
    pub z_position: f32,
    pub width: f32,
    pub height: f32,
    /// (x, y, z)
    pub center: [f32; 3],
    pub normal: [f32; 3],
}

impl ModelManifest {
    /// Plane of slice `index`, `None` when out of range.
    pub fn slice_plane(&self, index: usize) -> Option<SlicePlane> {
        if index >= self.slice_count {
            return None;
        }
        let [_, rows, cols] = self.dimensions;
        let [sz, sy, sx] = self.voxel_spacing;
        let z_position = index as f32 * sz;
        let width = cols as f32 * sx;
        let height = rows as f32 * sy;
        Some(SlicePlane {
            slice_index: index,
            z_position,
            width,
            height,
            center: [width / 2.0, height / 2.0, z_position],
            normal: [0.0, 0.0, 1.0],
        })
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            series_id: self.series_id.clone(),
            tissues: self.tissues.iter().map(|t| t.name.clone()).collect(),
            slice_count: self.slice_count,
        }
    }
}

/// Meshes ready for export plus their manifest.
#[derive(Clone, Debug)]
pub struct Scene {
    pub meshes: Vec<MeshArtifact>,
    pub manifest: ModelManifest,
    /// `"<tissue> (<reason>)"` for every tissue that produced no mesh.
    pub failures: Vec<String>,
}

/// Segments a volume once and meshes each requested tissue.
pub struct SceneAssembler {
    segmenter: TissueSegmenter,
    builder: VolumetricMeshBuilder,
    mesh_params: MeshParams,
}

impl SceneAssembler {
    pub fn new(segmentation: SegmentationParams, mesh: MeshParams) -> Self {
        Self {
            segmenter: TissueSegmenter::new(segmentation),
            builder: VolumetricMeshBuilder::new(mesh),
            mesh_params: mesh,
        }
    }

    /// Full-resolution mesh spacing.
    ///
    /// z starts at the slice thickness times [`MeshParams::z_spacing_scale`]
    /// and falls back to the mean pixel spacing once it exceeds
    /// [`MeshParams::z_spacing_cap_ratio`] times that mean. Missing values
    /// count as 1 mm.
    pub fn mesh_spacing(volume: &Volume, params: &MeshParams) -> VoxelSpacing {
        let (row, col) = volume.pixel_spacing.unwrap_or((1.0, 1.0));
        let mean_pixel = (row + col) / 2.0;
        let mut z = volume.slice_thickness.unwrap_or(1.0) * params.z_spacing_scale;
        if z > mean_pixel * params.z_spacing_cap_ratio {
            z = mean_pixel;
        }
        VoxelSpacing::new(z, row, col)
    }

    pub fn assemble(
        &self,
        series_id: &str,
        volume: &Volume,
        slice_count: usize,
        tissues: &[TissueKind],
    ) -> Result<Scene> {
        self.assemble_with_progress(series_id, volume, slice_count, tissues, |_| {})
    }

    /// Build every requested tissue, reporting progress (0 to 90) as it goes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientData`] for volumes too small to mesh,
    /// segmentation errors, and [`Error::NoUsableMeshes`] when no tissue
    /// produced a mesh.
    pub fn assemble_with_progress(
        &self,
        series_id: &str,
        volume: &Volume,
        slice_count: usize,
        tissues: &[TissueKind],
        mut on_progress: impl FnMut(u8),
    ) -> Result<Scene> {
        let (depth, rows, cols) = volume.dim();
        if depth < MIN_MODEL_SLICES {
            return Err(Error::InsufficientData(format!(
                "need at least {MIN_MODEL_SLICES} slices for a 3D model, got {depth}"
            )));
        }
        if rows < MIN_MODEL_EXTENT || cols < MIN_MODEL_EXTENT {
            return Err(Error::InsufficientData(format!(
                "slice dimensions {rows}x{cols} are below {MIN_MODEL_EXTENT}x{MIN_MODEL_EXTENT}"
            )));
        }

        let spacing = Self::mesh_spacing(volume, &self.mesh_params);
        let down = Interpolator::downsample(volume.data(), spacing, self.mesh_params.downsample_target);
        if down.factor > 1.0 {
            info!(
                factor = down.factor,
                from = ?volume.dim(),
                to = ?down.data.dim(),
                "Downsampled volume for meshing"
            );
        }
        on_progress(10);

        let masks = self.segmenter.segment_volume(&down.data, down.factor)?;
        on_progress(20);

        let mut meshes = Vec::new();
        let mut failures = Vec::new();
        for (i, &tissue) in tissues.iter().enumerate() {
            let mask = masks.mask_for(tissue);
            match self.builder.build(
                &mask,
                down.spacing,
                tissue.target_faces(),
                tissue.keep_small_objects(),
            ) {
                Ok(mesh) => {
                    info!(tissue = tissue.name(), faces = mesh.face_count(), "Tissue meshed");
                    meshes.push(MeshArtifact::new(tissue, mesh));
                }
                Err(err) => {
                    warn!(tissue = tissue.name(), %err, "Tissue produced no mesh");
                    let reason = match err {
                        Error::NoGeometry(_) => "no valid geometry".to_string(),
                        other => other.to_string(),
                    };
                    failures.push(format!("{} ({reason})", tissue.name()));
                }
            }
            on_progress(20 + (70 * (i + 1) / tissues.len().max(1)) as u8);
        }

        if meshes.is_empty() {
            return Err(Error::NoUsableMeshes(failures));
        }

        let (dz, dy, dx) = down.data.dim();
        let manifest = ModelManifest {
            series_id: series_id.to_string(),
            tissues: meshes.iter().map(TissueInfo::from).collect(),
            slice_count,
            dimensions: [dz, dy, dx],
            voxel_spacing: down.spacing.to_array(),
            glb_path: None,
        };
        Ok(Scene {
            meshes,
            manifest,
            failures,
        })
    }
}

impl Default for SceneAssembler {
    fn default() -> Self {
        Self::new(SegmentationParams::volume(), MeshParams::default())
    }
}
