use ndarray::{Array2, Array3, ArrayView2, s};

/// One cross-sectional image in physical intensity units.
#[derive(Clone, Debug)]
pub struct Slice {
    pub pixels: Array2<f32>,
    /// In-plane spacing (row, column) in mm.
    pub pixel_spacing: Option<(f32, f32)>,
    /// Ordering key, usually the DICOM instance number.
    pub order: i32,
}

impl Slice {
    pub fn new(pixels: Array2<f32>, pixel_spacing: Option<(f32, f32)>, order: i32) -> Self {
        Self {
            pixels,
            pixel_spacing,
            order,
        }
    }

    /// (rows, columns)
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }
}

/// Slices stacked along z with one shared in-plane shape.
#[derive(Clone, Debug, Default)]
pub struct Volume {
    pub data: Array3<f32>,
    pub pixel_spacing: Option<(f32, f32)>,
    pub slice_thickness: Option<f32>,
    /// Slices dropped because their shape disagreed with the majority.
    pub excluded_slices: usize,
}

impl Volume {
    pub fn new(
        data: Array3<f32>,
        pixel_spacing: Option<(f32, f32)>,
        slice_thickness: Option<f32>,
    ) -> Self {
        Self {
            data,
            pixel_spacing,
            slice_thickness,
            excluded_slices: 0,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn slice_count(&self) -> usize {
        self.data.dim().0
    }

    /// Axial slice at `index`, `None` when out of range.
    pub fn axial(&self, index: usize) -> Option<ArrayView2<'_, f32>> {
        (index < self.slice_count()).then(|| self.data.slice(s![index, .., ..]))
    }

    /// Intensity range over the whole volume.
    pub fn intensity_range(&self) -> Option<(f32, f32)> {
        crate::filters::min_max(self.data.iter().copied())
    }
}

/// Physical voxel extent (z, y, x) in mm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoxelSpacing {
    pub z: f32,
    pub y: f32,
    pub x: f32,
}

impl VoxelSpacing {
    pub fn new(z: f32, y: f32, x: f32) -> Self {
        Self { z, y, x }
    }

    /// Spacing after shrinking a grid by `factor` in every axis.
    pub fn scaled(self, factor: f32) -> Self {
        Self::new(self.z * factor, self.y * factor, self.x * factor)
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.z, self.y, self.x]
    }
}

impl Default for VoxelSpacing {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

impl From<[f32; 3]> for VoxelSpacing {
    fn from([z, y, x]: [f32; 3]) -> Self {
        Self::new(z, y, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axial_out_of_range_is_none() {
        let volume = Volume::new(Array3::zeros((2, 3, 4)), None, None);
        assert!(volume.axial(1).is_some());
        assert!(volume.axial(2).is_none());
        assert_eq!(volume.dim(), (2, 3, 4));
    }

    #[test]
    fn spacing_scales_every_axis() {
        let spacing = VoxelSpacing::new(2.0, 0.5, 0.75).scaled(4.0);
        assert_eq!(spacing.to_array(), [8.0, 2.0, 3.0]);
    }
}
