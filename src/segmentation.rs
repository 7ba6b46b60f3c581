//! Tissue classification by adaptive intensity thresholds and morphology.
//!
//! The same steps run for single slices and whole volumes. A slice is carried
//! as a depth-1 volume and processed with [`Neighborhood::Planar`].

use ndarray::{Array3, ArrayView2, Axis, Zip};
use tracing::{debug, info, warn};

use crate::{
    config::SegmentationParams,
    enums::{Neighborhood, TissueKind, TissueLabel},
    error::{Error, Result},
    filters::{gaussian_smooth, normalize, otsu_threshold, percentiles},
    morphology::{self, StructuringElement},
};

/// Intermediate boolean masks of one segmentation run.
#[derive(Clone, Debug)]
pub struct TissueMasks {
    pub body: Array3<bool>,
    /// Bright voxels after cleanup, visceral and subcutaneous together.
    pub fat: Array3<bool>,
    /// Body eroded inward then hole-filled. Fat inside it is visceral.
    pub inner_body: Array3<bool>,
    /// Mid-intensity body voxels, fat excluded.
    pub organ: Array3<bool>,
}

impl TissueMasks {
    pub fn visceral(&self) -> Array3<bool> {
        Zip::from(&self.fat)
            .and(&self.inner_body)
            .map_collect(|&fat, &inner| fat && inner)
    }

    pub fn subcutaneous(&self) -> Array3<bool> {
        Zip::from(&self.fat)
            .and(&self.inner_body)
            .map_collect(|&fat, &inner| fat && !inner)
    }

    /// Mask meshed for a requested tissue.
    pub fn mask_for(&self, kind: TissueKind) -> Array3<bool> {
        match kind {
            TissueKind::Body => self.body.clone(),
            TissueKind::VisceralFat => self.visceral(),
            TissueKind::SubcutaneousFat => self.subcutaneous(),
            TissueKind::Organs => self.organ.clone(),
        }
    }

    /// Collapse into one label per voxel. Visceral fat beats subcutaneous fat,
    /// which beats organ/muscle.
    pub fn to_labels(&self) -> SegmentationMask {
        let labels = Zip::from(&self.organ)
            .and(&self.fat)
            .and(&self.inner_body)
            .map_collect(|&organ, &fat, &inner| match (fat, inner, organ) {
                (true, true, _) => TissueLabel::VisceralFat,
                (true, false, _) => TissueLabel::SubcutaneousFat,
                (false, _, true) => TissueLabel::OrganOrMuscle,
                _ => TissueLabel::Background,
            });
        SegmentationMask { labels }
    }
}

/// One [`TissueLabel`] per voxel, shaped like the source grid.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationMask {
    labels: Array3<TissueLabel>,
}

impl SegmentationMask {
    /// All-background mask.
    pub fn background(dim: (usize, usize, usize)) -> Self {
        Self {
            labels: Array3::from_elem(dim, TissueLabel::Background),
        }
    }

    pub fn labels(&self) -> &Array3<TissueLabel> {
        &self.labels
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.labels.dim()
    }

    /// Labels of z-slice `index`.
    pub fn plane(&self, index: usize) -> Option<ArrayView2<'_, TissueLabel>> {
        (index < self.labels.len_of(Axis(0))).then(|| self.labels.index_axis(Axis(0), index))
    }

    pub fn count(&self, label: TissueLabel) -> usize {
        self.labels.iter().filter(|&&l| l == label).count()
    }

    /// Voxels with any non-background label.
    pub fn body_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_body()).count()
    }
}

/// Erosion depth after shrinking the grid by `downsample_factor`.
pub fn scaled_erosion_iterations(base: usize, downsample_factor: f32) -> usize {
    if downsample_factor <= 1.0 {
        base
    } else {
        ((base as f32 / downsample_factor) as usize).max(crate::config::MIN_EROSION_ITERATIONS)
    }
}

pub struct TissueSegmenter {
    params: SegmentationParams,
}

impl TissueSegmenter {
    pub fn new(params: SegmentationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SegmentationParams {
        &self.params
    }

    /// Classify one slice.
    ///
    /// Constant input gives an all-background mask.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBody`] if no pixel passes the body threshold.
    pub fn segment_slice(&self, pixels: ArrayView2<'_, f32>) -> Result<SegmentationMask> {
        let grid = pixels.insert_axis(Axis(0)).to_owned();
        let Some(normalized) = normalize(&grid) else {
            debug!("Slice has no intensity variation");
            return Ok(SegmentationMask::background(grid.dim()));
        };
        Ok(self.classify(&normalized, 1.0)?.to_labels())
    }

    /// Segment a whole (usually downsampled) volume into tissue masks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoIntensityVariation`] for constant input and
    /// [`Error::EmptyBody`] if no voxel passes the body threshold.
    pub fn segment_volume(&self, data: &Array3<f32>, downsample_factor: f32) -> Result<TissueMasks> {
        let normalized = normalize(data).ok_or(Error::NoIntensityVariation)?;
        self.classify(&normalized, downsample_factor)
    }

    /// Run every step on already normalised intensities.
    pub fn classify(&self, normalized: &Array3<f32>, downsample_factor: f32) -> Result<TissueMasks> {
        let p = &self.params;
        let nb = p.neighborhood;
        let smoothed = gaussian_smooth(normalized, p.sigma, nb);

        let values: Vec<f32> = smoothed.iter().copied().collect();
        let threshold = otsu_threshold(&values);
        let cutoff = threshold * p.body_threshold_factor;
        let body = smoothed.mapv(|v| v > cutoff);
        let body = morphology::fill_holes(&body, nb);
        let body = morphology::opening(&body, &StructuringElement::round(p.body_opening_radius, nb));
        let body = morphology::closing(&body, &StructuringElement::round(p.body_closing_radius, nb));

        let body_values: Vec<f32> = Zip::from(&smoothed)
            .and(&body)
            .fold(Vec::new(), |mut acc, &v, &inside| {
                if inside {
                    acc.push(v);
                }
                acc
            });
        let body_voxels = body_values.len();
        let Some(bands) = percentiles(body_values, &[p.organ_percentile, p.fat_percentile]) else {
            return Err(Error::EmptyBody);
        };
        let (organ_low, fat_low) = (bands[0], bands[1]);
        debug!(threshold, cutoff, body_voxels, organ_low, fat_low, "Computed intensity bands");

        let fat = Zip::from(&smoothed)
            .and(&body)
            .map_collect(|&v, &inside| inside && v >= fat_low);
        let fat = if p.fat_cleanup_radius > 0 {
            let element = StructuringElement::round(p.fat_cleanup_radius, nb);
            morphology::closing(&morphology::opening(&fat, &element), &element)
        } else {
            fat
        };

        let organ = Zip::from(&smoothed)
            .and(&body)
            .and(&fat)
            .map_collect(|&v, &inside, &is_fat| inside && !is_fat && v >= organ_low && v < fat_low);

        let inner_body = self.inner_body(&body, downsample_factor);

        Ok(TissueMasks {
            body,
            fat,
            inner_body,
            organ,
        })
    }

    /// Erode the body inward slice by slice and refill holes.
    ///
    /// On a downsampled grid the erosion depth is scaled by the factor. With
    /// `inner_body_min_ratio` set, too aggressive an erosion is retried once
    /// with half the iterations.
    pub fn inner_body(&self, body: &Array3<bool>, downsample_factor: f32) -> Array3<bool> {
        let mut iterations =
            scaled_erosion_iterations(self.params.erosion_iterations, downsample_factor);
        if downsample_factor > 1.0 {
            info!(
                iterations,
                base = self.params.erosion_iterations,
                factor = downsample_factor,
                "Scaled erosion iterations"
            );
        }
        let mut inner = Self::erode_slices(body, iterations);

        if let Some(min_ratio) = self.params.inner_body_min_ratio {
            let body_voxels = morphology::count(body);
            let ratio = if body_voxels > 0 {
                morphology::count(&inner) as f64 / body_voxels as f64
            } else {
                0.0
            };
            if ratio < min_ratio {
                let reduced = (iterations / 2).max(1);
                warn!(
                    ratio,
                    from = iterations,
                    to = reduced,
                    "Erosion left too little inner body, retrying"
                );
                iterations = reduced;
                inner = Self::erode_slices(body, iterations);
            }
        }
        debug!(iterations, inner_voxels = morphology::count(&inner), "Computed inner body");
        inner
    }

    fn erode_slices(body: &Array3<bool>, iterations: usize) -> Array3<bool> {
        let element = StructuringElement::cross(Neighborhood::Planar);
        let eroded = morphology::erode_iterations(body, &element, iterations);
        morphology::fill_holes(&eroded, Neighborhood::Planar)
    }
}

impl Default for TissueSegmenter {
    fn default() -> Self {
        Self::new(SegmentationParams::slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Disk body of radius 50 with an organ ramp, a bright 5-pixel outer ring
    /// and a bright central blob.
    fn phantom() -> Array2<f32> {
        let (cy, cx) = (64.0_f32, 64.0_f32);
        Array2::from_shape_fn((128, 128), |(y, x)| {
            let r = ((y as f32 - cy).powi(2) + (x as f32 - cx).powi(2)).sqrt();
            if r >= 50.0 {
                0.0
            } else if r >= 45.0 || r < 8.0 {
                200.0
            } else {
                80.0 + 60.0 * x as f32 / 128.0
            }
        })
    }

    #[test]
    fn every_pixel_gets_exactly_one_label() {
        let mask = TissueSegmenter::default()
            .segment_slice(phantom().view())
            .unwrap();
        let total: usize = TissueLabel::ALL.iter().map(|&l| mask.count(l)).sum();
        assert_eq!(total, 128 * 128);
        assert_eq!(mask.dim(), (1, 128, 128));
    }

    #[test]
    fn phantom_regions_get_expected_labels() {
        let params = SegmentationParams {
            sigma: 0.0,
            fat_cleanup_radius: 1,
            ..SegmentationParams::slice()
        };
        let mask = TissueSegmenter::new(params)
            .segment_slice(phantom().view())
            .unwrap();
        let plane = mask.plane(0).unwrap();
        assert_eq!(plane[[64, 64]], TissueLabel::VisceralFat);
        assert_eq!(plane[[64, 64 + 47]], TissueLabel::SubcutaneousFat);
        assert_eq!(plane[[64, 64 - 47]], TissueLabel::SubcutaneousFat);
        assert_eq!(plane[[0, 0]], TissueLabel::Background);
        assert!(mask.count(TissueLabel::OrganOrMuscle) > 0);
    }

    #[test]
    fn default_params_find_central_visceral_fat() {
        let mask = TissueSegmenter::default()
            .segment_slice(phantom().view())
            .unwrap();
        let plane = mask.plane(0).unwrap();
        assert_eq!(plane[[64, 64]], TissueLabel::VisceralFat);
        assert_eq!(plane[[2, 2]], TissueLabel::Background);
    }

    #[test]
    fn constant_slice_is_all_background() {
        let pixels = Array2::from_elem((32, 32), 42.0);
        let mask = TissueSegmenter::default()
            .segment_slice(pixels.view())
            .unwrap();
        assert_eq!(mask.count(TissueLabel::Background), 32 * 32);
        assert_eq!(mask.body_count(), 0);
    }

    #[test]
    fn constant_volume_has_no_intensity_variation() {
        let data = Array3::from_elem((3, 16, 16), 5.0);
        let segmenter = TissueSegmenter::new(SegmentationParams::volume());
        assert!(matches!(
            segmenter.segment_volume(&data, 1.0),
            Err(Error::NoIntensityVariation)
        ));
    }

    #[test]
    fn fat_wins_over_organ() {
        let dim = (1, 1, 3);
        let masks = TissueMasks {
            body: Array3::from_elem(dim, true),
            fat: Array3::from_shape_vec(dim, vec![true, true, false]).unwrap(),
            inner_body: Array3::from_shape_vec(dim, vec![true, false, false]).unwrap(),
            organ: Array3::from_elem(dim, true),
        };
        let mask = masks.to_labels();
        let labels: Vec<TissueLabel> = mask.labels().iter().copied().collect();
        assert_eq!(
            labels,
            vec![
                TissueLabel::VisceralFat,
                TissueLabel::SubcutaneousFat,
                TissueLabel::OrganOrMuscle
            ]
        );
    }

    #[test]
    fn erosion_scales_with_downsampling() {
        assert_eq!(scaled_erosion_iterations(12, 1.0), 12);
        assert_eq!(scaled_erosion_iterations(12, 4.0), 3);
        assert_eq!(scaled_erosion_iterations(12, 10.0), 2);
    }

    #[test]
    fn aggressive_erosion_is_retried_once_at_half_depth() {
        let body = Array3::from_shape_fn((3, 30, 30), |(_, y, x)| {
            (5..25).contains(&y) && (5..25).contains(&x)
        });
        let params = SegmentationParams::volume().with_erosion_iterations(8);
        let inner = TissueSegmenter::new(params).inner_body(&body, 1.0);
        // 8 iterations leave 4x4 per slice (4%), the retry with 4 leaves 12x12.
        assert_eq!(morphology::count(&inner), 3 * 144);

        let params = SegmentationParams::slice().with_erosion_iterations(8);
        let inner = TissueSegmenter::new(params).inner_body(&body, 1.0);
        assert_eq!(morphology::count(&inner), 3 * 16);
    }
}
