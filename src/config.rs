//! Algorithm constants and runtime settings.
//!
//! Downstream statistics and mesh shape are sensitive to every value in this
//! module. The two body threshold factors differ on purpose: the volumetric
//! path works on downsampled, smoother data.

use std::path::{Path, PathBuf};

use crate::enums::Neighborhood;

/// Body mask cutoff as a fraction of the Otsu threshold, per-slice analysis.
pub const SLICE_BODY_THRESHOLD_FACTOR: f32 = 0.25;
/// Body mask cutoff as a fraction of the Otsu threshold, volumetric meshing.
pub const VOLUME_BODY_THRESHOLD_FACTOR: f32 = 0.30;
/// Lower bound of the organ/muscle intensity band (percentile of body voxels).
pub const ORGAN_PERCENTILE: f64 = 15.0;
/// Fat cutoff (percentile of body voxels). Also the organ band's upper bound.
pub const FAT_PERCENTILE: f64 = 75.0;
/// Gaussian sigma applied before thresholding.
pub const SEGMENTATION_SIGMA: f32 = 1.0;
/// Radius of the disk/ball used to open the body mask.
pub const BODY_OPENING_RADIUS: usize = 2;
/// Radius of the disk/ball used to close the body mask.
pub const BODY_CLOSING_RADIUS: usize = 3;
/// Radius used for the opening+closing pass over the fat mask.
pub const FAT_CLEANUP_RADIUS: usize = 2;
/// Inward erosion depth separating subcutaneous from visceral fat, at full resolution.
pub const EROSION_ITERATIONS: usize = 12;
/// Floor for erosion iterations after scaling by the downsample factor.
pub const MIN_EROSION_ITERATIONS: usize = 2;
/// Minimum inner-body / body voxel ratio before the single erosion retry kicks in.
pub const INNER_BODY_MIN_RATIO: f64 = 0.30;

/// Largest volume dimension tolerated before isotropic downsampling.
pub const DOWNSAMPLE_TARGET: usize = 128;
/// Fewest set voxels a tissue mask may have and still be meshed.
pub const MIN_MESH_VOXELS: usize = 10;
/// Masks at or below this voxel count skip the opening step.
pub const OPENING_MIN_VOXELS: usize = 2000;
/// Components smaller than this fraction of the largest one are pruned.
pub const SMALL_COMPONENT_FRACTION: f64 = 0.005;
/// Gaussian sigma turning a boolean mask into a scalar field.
pub const MESH_SIGMA: f32 = 1.2;
/// Iso level extracted from the smoothed mask.
pub const ISO_LEVEL: f32 = 0.5;
pub const LAPLACIAN_ITERATIONS: u32 = 2;
pub const LAPLACIAN_LAMBDA: f32 = 0.5;
/// Mesh z spacing starts at slice thickness times this factor.
pub const Z_SPACING_SCALE: f32 = 0.55;
/// Mesh z spacing is capped to the mean pixel spacing once it exceeds this multiple of it.
pub const Z_SPACING_CAP_RATIO: f32 = 1.5;
/// Minimum slices for a 3D model.
pub const MIN_MODEL_SLICES: usize = 3;
/// Minimum in-plane rows/columns for a 3D model.
pub const MIN_MODEL_EXTENT: usize = 10;

pub const OVERLAY_ALPHA: f32 = 0.5;
pub const OVERLAY_LOW_PERCENTILE: f64 = 1.0;
pub const OVERLAY_HIGH_PERCENTILE: f64 = 99.0;

/// Buffered progress events before the analysis task waits for its consumer.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// Parameters of the tissue segmenter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentationParams {
    pub body_threshold_factor: f32,
    pub sigma: f32,
    pub body_opening_radius: usize,
    pub body_closing_radius: usize,
    pub fat_cleanup_radius: usize,
    pub organ_percentile: f64,
    pub fat_percentile: f64,
    pub erosion_iterations: usize,
    /// Enables the single halving retry when erosion leaves too little inner body.
    pub inner_body_min_ratio: Option<f64>,
    pub neighborhood: Neighborhood,
}

impl SegmentationParams {
    /// Parameters for single-slice analysis.
    pub fn slice() -> Self {
        Self {
            body_threshold_factor: SLICE_BODY_THRESHOLD_FACTOR,
            sigma: SEGMENTATION_SIGMA,
            body_opening_radius: BODY_OPENING_RADIUS,
            body_closing_radius: BODY_CLOSING_RADIUS,
            fat_cleanup_radius: FAT_CLEANUP_RADIUS,
            organ_percentile: ORGAN_PERCENTILE,
            fat_percentile: FAT_PERCENTILE,
            erosion_iterations: EROSION_ITERATIONS,
            inner_body_min_ratio: None,
            neighborhood: Neighborhood::Planar,
        }
    }

    /// Parameters for whole-volume segmentation feeding the mesh builder.
    ///
    /// Morphology radii are smaller since the volume is usually downsampled.
    pub fn volume() -> Self {
        Self {
            body_threshold_factor: VOLUME_BODY_THRESHOLD_FACTOR,
            body_opening_radius: 1,
            body_closing_radius: 2,
            fat_cleanup_radius: 1,
            inner_body_min_ratio: Some(INNER_BODY_MIN_RATIO),
            neighborhood: Neighborhood::Volumetric,
            ..Self::slice()
        }
    }

    #[must_use]
    pub fn with_body_threshold_factor(mut self, factor: f32) -> Self {
        self.body_threshold_factor = factor;
        self
    }

    #[must_use]
    pub fn with_sigma(mut self, sigma: f32) -> Self {
        self.sigma = sigma;
        self
    }

    #[must_use]
    pub fn with_erosion_iterations(mut self, iterations: usize) -> Self {
        self.erosion_iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_inner_body_min_ratio(mut self, ratio: Option<f64>) -> Self {
        self.inner_body_min_ratio = ratio;
        self
    }
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self::slice()
    }
}

/// Parameters of the volumetric mesh builder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshParams {
    pub sigma: f32,
    pub iso_level: f32,
    pub min_voxels: usize,
    pub opening_min_voxels: usize,
    pub small_component_fraction: f64,
    pub laplacian_iterations: u32,
    pub laplacian_lambda: f32,
    pub downsample_target: usize,
    pub z_spacing_scale: f32,
    pub z_spacing_cap_ratio: f32,
}

impl Default for MeshParams {
    fn default() -> Self {
        Self {
            sigma: MESH_SIGMA,
            iso_level: ISO_LEVEL,
            min_voxels: MIN_MESH_VOXELS,
            opening_min_voxels: OPENING_MIN_VOXELS,
            small_component_fraction: SMALL_COMPONENT_FRACTION,
            laplacian_iterations: LAPLACIAN_ITERATIONS,
            laplacian_lambda: LAPLACIAN_LAMBDA,
            downsample_target: DOWNSAMPLE_TARGET,
            z_spacing_scale: Z_SPACING_SCALE,
            z_spacing_cap_ratio: Z_SPACING_CAP_RATIO,
        }
    }
}

impl MeshParams {
    #[must_use]
    pub fn with_downsample_target(mut self, target: usize) -> Self {
        self.downsample_target = target;
        self
    }

    #[must_use]
    pub fn with_laplacian_iterations(mut self, iterations: u32) -> Self {
        self.laplacian_iterations = iterations;
        self
    }

    /// Keep slice thickness as the mesh z spacing, unscaled and uncapped.
    #[must_use]
    pub fn with_physical_z_spacing(mut self) -> Self {
        self.z_spacing_scale = 1.0;
        self.z_spacing_cap_ratio = f32::INFINITY;
        self
    }
}

/// Where artifacts are written.
#[derive(Clone, Debug)]
pub struct Settings {
    pub assets_dir: PathBuf,
}

impl Settings {
    pub const ASSETS_DIR_ENV: &'static str = "TISSUE_VOLUME_ASSETS_DIR";

    pub fn new(assets_dir: impl AsRef<Path>) -> Self {
        Self {
            assets_dir: assets_dir.as_ref().to_path_buf(),
        }
    }

    /// Reads `TISSUE_VOLUME_ASSETS_DIR`, falling back to `./assets`.
    pub fn from_env() -> Self {
        let dir = std::env::var_os(Self::ASSETS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets"));
        Self::new(dir)
    }

    /// Overlay images and analysis records.
    pub fn images_dir(&self) -> PathBuf {
        self.assets_dir.join("images")
    }

    /// GLB scenes and model manifests.
    pub fn models_dir(&self) -> PathBuf {
        self.assets_dir.join("models")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.images_dir())?;
        std::fs::create_dir_all(self.models_dir())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_and_volume_paths_keep_distinct_thresholds() {
        assert_eq!(SegmentationParams::slice().body_threshold_factor, 0.25);
        assert_eq!(SegmentationParams::volume().body_threshold_factor, 0.30);
    }

    #[test]
    fn only_volume_path_retries_erosion() {
        assert!(SegmentationParams::slice().inner_body_min_ratio.is_none());
        assert_eq!(
            SegmentationParams::volume().inner_body_min_ratio,
            Some(INNER_BODY_MIN_RATIO)
        );
    }

    #[test]
    fn settings_layout() {
        let settings = Settings::new("/tmp/tv");
        assert_eq!(settings.images_dir(), PathBuf::from("/tmp/tv/images"));
        assert_eq!(settings.models_dir(), PathBuf::from("/tmp/tv/models"));
    }
}
