use image::{Rgb, RgbImage};
use ndarray::ArrayView2;

use crate::{
    config::{OVERLAY_ALPHA, OVERLAY_HIGH_PERCENTILE, OVERLAY_LOW_PERCENTILE},
    enums::TissueLabel,
    error::{Error, Result},
    filters::percentiles,
};

/// Color-coded diagnostic rendering of an analyzed slice.
pub struct OverlayRenderer;

impl OverlayRenderer {
    /// Blend label colors over a percentile-windowed grayscale image.
    ///
    /// Background pixels stay pure grayscale; labelled pixels are mixed with
    /// their label color at [`OVERLAY_ALPHA`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientData`] if the label grid and the slice
    /// differ in shape.
    pub fn render(
        pixels: ArrayView2<'_, f32>,
        labels: ArrayView2<'_, TissueLabel>,
    ) -> Result<RgbImage> {
        if pixels.dim() != labels.dim() {
            return Err(Error::InsufficientData(format!(
                "overlay shape mismatch: slice {:?}, labels {:?}",
                pixels.dim(),
                labels.dim()
            )));
        }
        let (rows, cols) = pixels.dim();
        let (lo, hi) = Self::window(pixels);
        let scale = 255.0 / (hi - lo);

        Ok(RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
            let idx = [y as usize, x as usize];
            let gray = ((pixels[idx].clamp(lo, hi) - lo) * scale) as u8;
            match labels[idx].overlay_color() {
                Some(color) => Rgb(color.map(|c| blend(gray, c))),
                None => Rgb([gray; 3]),
            }
        }))
    }

    /// Grayscale window: 1st to 99th percentile, at least one unit wide.
    pub fn window(pixels: ArrayView2<'_, f32>) -> (f32, f32) {
        let values: Vec<f32> = pixels.iter().copied().collect();
        match percentiles(values, &[OVERLAY_LOW_PERCENTILE, OVERLAY_HIGH_PERCENTILE]) {
            Some(bounds) if bounds[1] - bounds[0] >= 1.0 => (bounds[0], bounds[1]),
            Some(bounds) => (bounds[0], bounds[0] + 1.0),
            None => (0.0, 1.0),
        }
    }
}

#[inline]
fn blend(gray: u8, color: u8) -> u8 {
    (f32::from(gray) * (1.0 - OVERLAY_ALPHA) + f32::from(color) * OVERLAY_ALPHA) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn background_stays_gray_and_labels_are_tinted() {
        let pixels = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32 * 10.0);
        let mut labels = Array2::from_elem((4, 4), TissueLabel::Background);
        labels[[3, 3]] = TissueLabel::VisceralFat;
        let image = OverlayRenderer::render(pixels.view(), labels.view()).unwrap();

        assert_eq!(image.dimensions(), (4, 4));
        let Rgb([r, g, b]) = *image.get_pixel(0, 0);
        assert_eq!((r, g, b), (0, 0, 0));
        let Rgb([r, g, b]) = *image.get_pixel(1, 1);
        assert!(r == g && g == b);
        // Brightest pixel is white before blending with orange.
        assert_eq!(image.get_pixel(3, 3).0, [255, 210, 127]);
    }

    #[test]
    fn narrow_window_is_widened_to_one_unit() {
        let pixels = Array2::from_elem((3, 3), 7.0);
        assert_eq!(OverlayRenderer::window(pixels.view()), (7.0, 8.0));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let pixels = Array2::zeros((3, 3));
        let labels = Array2::from_elem((2, 3), TissueLabel::Background);
        assert!(OverlayRenderer::render(pixels.view(), labels.view()).is_err());
    }
}
