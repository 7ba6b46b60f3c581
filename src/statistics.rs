use serde::{Deserialize, Serialize};

use crate::{enums::TissueLabel, segmentation::SegmentationMask};

/// Fat counts of one analyzed slice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceStatistics {
    pub index: usize,
    pub visceral_fat_pixels: usize,
    pub subcutaneous_fat_pixels: usize,
    pub visceral_fat_area_cm2: f64,
}

/// Series totals.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TissueVolumeStatistics {
    pub total_visceral_fat_volume: f64,
    pub total_subcutaneous_fat_volume: f64,
    pub visceral_fat_percentage: f64,
    pub slice_stats: Vec<SliceStatistics>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Area in cm² of `pixels` pixels. Zero without spacing.
pub fn area_cm2(pixels: usize, pixel_spacing: Option<(f32, f32)>) -> f64 {
    pixel_spacing.map_or(0.0, |(row, col)| {
        round2(pixels as f64 * f64::from(row) * f64::from(col) / 100.0)
    })
}

/// Volume in cm³ of `voxels` voxels. Zero unless both spacing and thickness are known.
pub fn volume_cm3(voxels: usize, pixel_spacing: Option<(f32, f32)>, slice_thickness: Option<f32>) -> f64 {
    match (pixel_spacing, slice_thickness) {
        (Some((row, col)), Some(thickness)) => round2(
            voxels as f64 * f64::from(row) * f64::from(col) * f64::from(thickness) / 1000.0,
        ),
        _ => 0.0,
    }
}

/// Visceral share of body voxels in percent, 0 for an empty body.
pub fn visceral_percentage(visceral: usize, body: usize) -> f64 {
    if body == 0 {
        0.0
    } else {
        round2(visceral as f64 / body as f64 * 100.0)
    }
}

/// Accumulates per-slice counts into series totals.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    pixel_spacing: Option<(f32, f32)>,
    slice_thickness: Option<f32>,
    visceral: usize,
    subcutaneous: usize,
    body: usize,
    slices: Vec<SliceStatistics>,
}

impl StatisticsAggregator {
    /// `pixel_spacing` and `slice_thickness` are the series values used for volumes.
    pub fn new(pixel_spacing: Option<(f32, f32)>, slice_thickness: Option<f32>) -> Self {
        Self {
            pixel_spacing,
            slice_thickness,
            ..Self::default()
        }
    }

    /// Record one slice. Area uses the slice's own pixel spacing.
    pub fn add_slice(
        &mut self,
        index: usize,
        mask: &SegmentationMask,
        pixel_spacing: Option<(f32, f32)>,
    ) -> SliceStatistics {
        let visceral = mask.count(TissueLabel::VisceralFat);
        let subcutaneous = mask.count(TissueLabel::SubcutaneousFat);
        self.visceral += visceral;
        self.subcutaneous += subcutaneous;
        self.body += mask.body_count();

        let stats = SliceStatistics {
            index,
            visceral_fat_pixels: visceral,
            subcutaneous_fat_pixels: subcutaneous,
            visceral_fat_area_cm2: area_cm2(visceral, pixel_spacing),
        };
        self.slices.push(stats.clone());
        stats
    }

    pub fn finish(self) -> TissueVolumeStatistics {
        TissueVolumeStatistics {
            total_visceral_fat_volume: volume_cm3(
                self.visceral,
                self.pixel_spacing,
                self.slice_thickness,
            ),
            total_subcutaneous_fat_volume: volume_cm3(
                self.subcutaneous,
                self.pixel_spacing,
                self.slice_thickness,
            ),
            visceral_fat_percentage: visceral_percentage(self.visceral, self.body),
            slice_stats: self.slices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    use crate::segmentation::TissueMasks;

    #[test]
    fn area_and_volume_conversions() {
        assert_relative_eq!(area_cm2(100, Some((2.0, 2.0))), 4.0);
        assert_relative_eq!(volume_cm3(100, Some((2.0, 2.0)), Some(5.0)), 2.0);
        assert_eq!(area_cm2(100, None), 0.0);
        assert_eq!(volume_cm3(100, Some((2.0, 2.0)), None), 0.0);
    }

    #[test]
    fn percentage_of_empty_body_is_zero() {
        assert_eq!(visceral_percentage(0, 0), 0.0);
        assert_relative_eq!(visceral_percentage(1, 3), 33.33);
    }

    #[test]
    fn aggregates_slices() {
        let dim = (1, 10, 20);
        let fat = Array3::from_shape_fn(dim, |(_, y, _)| y < 5);
        let masks = TissueMasks {
            body: Array3::from_elem(dim, true),
            inner_body: Array3::from_shape_fn(dim, |(_, _, x)| x < 10),
            organ: Array3::from_elem(dim, true),
            fat,
        };
        let mask = masks.to_labels();
        let mut aggregator = StatisticsAggregator::new(Some((2.0, 2.0)), Some(5.0));
        let first = aggregator.add_slice(0, &mask, Some((2.0, 2.0)));
        aggregator.add_slice(1, &mask, Some((2.0, 2.0)));

        assert_eq!(first.visceral_fat_pixels, 50);
        assert_eq!(first.subcutaneous_fat_pixels, 50);
        assert_relative_eq!(first.visceral_fat_area_cm2, 2.0);

        let totals = aggregator.finish();
        assert_relative_eq!(totals.total_visceral_fat_volume, 2.0);
        assert_relative_eq!(totals.total_subcutaneous_fat_volume, 2.0);
        assert_relative_eq!(totals.visceral_fat_percentage, 25.0);
        assert_eq!(totals.slice_stats.len(), 2);
    }
}
