//! Intensity filters over slice/volume grids.
//!
//! Single slices are carried as depth-1 volumes; `Neighborhood::Planar` keeps
//! every operation inside its own z-slice.

use ndarray::{Array3, ArrayView1, ArrayViewMut1, Axis, Zip};
use rayon::prelude::*;

use crate::enums::Neighborhood;

/// Number of histogram bins for Otsu thresholding.
const HISTOGRAM_BINS: usize = 256;

pub fn min_max(values: impl IntoIterator<Item = f32>) -> Option<(f32, f32)> {
    values.into_iter().fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// Min-max normalise to [0, 1]. `None` when the range is zero.
pub fn normalize(data: &Array3<f32>) -> Option<Array3<f32>> {
    let (lo, hi) = min_max(data.iter().copied())?;
    let range = hi - lo;
    if range <= 0.0 || !range.is_finite() {
        return None;
    }
    let inv_range = 1.0 / range;
    Some(data.mapv(|v| (v - lo) * inv_range))
}

/// Build a 1D Gaussian kernel truncated at 3 sigma.
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Separable Gaussian smoothing. Kernel weights falling outside the grid are
/// dropped and the remainder renormalised.
pub fn gaussian_smooth(data: &Array3<f32>, sigma: f32, neighborhood: Neighborhood) -> Array3<f32> {
    if sigma <= 0.0 {
        return data.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let axes: &[usize] = match neighborhood {
        Neighborhood::Planar => &[2, 1],
        Neighborhood::Volumetric => &[2, 1, 0],
    };

    let mut current = data.clone();
    for &axis in axes {
        let mut next = Array3::<f32>::zeros(current.raw_dim());
        Zip::from(next.lanes_mut(Axis(axis)))
            .and(current.lanes(Axis(axis)))
            .par_for_each(|out, input| convolve_lane(input, out, &kernel));
        current = next;
    }
    current
}

fn convolve_lane(input: ArrayView1<'_, f32>, mut output: ArrayViewMut1<'_, f32>, kernel: &[f32]) {
    let len = input.len() as isize;
    let half = (kernel.len() / 2) as isize;
    for i in 0..len {
        let mut sum = 0.0_f32;
        let mut weight = 0.0_f32;
        for (k, &kval) in kernel.iter().enumerate() {
            let j = i + k as isize - half;
            if (0..len).contains(&j) {
                sum += input[j as usize] * kval;
                weight += kval;
            }
        }
        output[i as usize] = if weight > 0.0 { sum / weight } else { 0.0 };
    }
}

/// Compute the optimal threshold using Otsu's method.
///
/// Maximizes inter-class variance on a 256-bin histogram. Plateaus of equal
/// variance resolve to their middle bin.
pub fn otsu_threshold(values: &[f32]) -> f32 {
    let Some((min_val, max_val)) = min_max(values.iter().copied()) else {
        return 0.0;
    };
    let range = max_val - min_val;
    if range <= 0.0 {
        return min_val;
    }

    let scale = (HISTOGRAM_BINS - 1) as f32 / range;
    let histogram = values
        .par_iter()
        .fold(
            || [0u64; HISTOGRAM_BINS],
            |mut hist, &val| {
                let bin = (((val - min_val) * scale) as usize).min(HISTOGRAM_BINS - 1);
                hist[bin] += 1;
                hist
            },
        )
        .reduce(
            || [0u64; HISTOGRAM_BINS],
            |mut a, b| {
                a.iter_mut().zip(b.iter()).for_each(|(x, y)| *x += y);
                a
            },
        );

    let total = values.len() as f64;
    let total_sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut best_first = 0;
    let mut best_last = 0;
    let mut best_variance = 0.0_f64;
    let mut background_count = 0.0_f64;
    let mut background_sum = 0.0_f64;

    for (t, &count) in histogram.iter().enumerate() {
        background_count += count as f64;
        if background_count == 0.0 {
            continue;
        }
        let foreground_count = total - background_count;
        if foreground_count == 0.0 {
            break;
        }
        background_sum += t as f64 * count as f64;
        let mean_bg = background_sum / background_count;
        let mean_fg = (total_sum - background_sum) / foreground_count;
        let diff = mean_bg - mean_fg;
        let variance = background_count * foreground_count * diff * diff;

        if variance > best_variance {
            best_variance = variance;
            best_first = t;
            best_last = t;
        } else if (variance - best_variance).abs() <= f64::EPSILON * best_variance.abs() {
            best_last = t;
        }
    }

    min_val + ((best_first + best_last) / 2) as f32 / scale
}

/// Percentiles (0..=100) with linear interpolation between order statistics.
/// Returns `None` for an empty sample.
pub fn percentiles(mut values: Vec<f32>, qs: &[f64]) -> Option<Vec<f32>> {
    if values.is_empty() {
        return None;
    }
    values.par_sort_unstable_by(f32::total_cmp);
    let last = (values.len() - 1) as f64;
    Some(
        qs.iter()
            .map(|&q| {
                let rank = (q.clamp(0.0, 100.0) / 100.0) * last;
                let lo = rank.floor() as usize;
                let hi = rank.ceil() as usize;
                let frac = (rank - lo as f64) as f32;
                values[lo] + (values[hi] - values[lo]) * frac
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    #[test]
    fn normalize_maps_to_unit_range() {
        let data = Array3::from_shape_vec((1, 1, 3), vec![-100.0, 0.0, 100.0]).unwrap();
        let normalized = normalize(&data).unwrap();
        assert_relative_eq!(normalized[[0, 0, 0]], 0.0);
        assert_relative_eq!(normalized[[0, 0, 1]], 0.5);
        assert_relative_eq!(normalized[[0, 0, 2]], 1.0);
    }

    #[test]
    fn normalize_rejects_constant_input() {
        assert!(normalize(&Array3::from_elem((2, 2, 2), 7.0)).is_none());
    }

    #[test]
    fn kernel_sums_to_one_and_is_symmetric() {
        let kernel = gaussian_kernel(1.2);
        let sum: f32 = kernel.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
        let n = kernel.len();
        for i in 0..n / 2 {
            assert_relative_eq!(kernel[i], kernel[n - 1 - i], epsilon = 1e-6);
        }
    }

    #[test]
    fn smoothing_preserves_uniform_volume() {
        let data = Array3::from_elem((3, 4, 5), 100.0);
        let smoothed = gaussian_smooth(&data, 1.0, Neighborhood::Volumetric);
        for &v in &smoothed {
            assert_relative_eq!(v, 100.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn planar_smoothing_does_not_mix_slices() {
        let mut data = Array3::zeros((3, 5, 5));
        data[[1, 2, 2]] = 1.0;
        let smoothed = gaussian_smooth(&data, 1.0, Neighborhood::Planar);
        assert!(smoothed.index_axis(Axis(0), 0).iter().all(|&v| v == 0.0));
        assert!(smoothed[[1, 2, 2]] < 1.0);
        assert!(smoothed[[1, 2, 3]] > 0.0);
    }

    #[test]
    fn otsu_separates_bimodal_values() {
        let mut values = vec![0.1_f32; 50];
        values.extend(vec![0.9_f32; 50]);
        let threshold = otsu_threshold(&values);
        assert!(threshold > 0.1 && threshold < 0.9, "got {threshold}");
    }

    #[test]
    fn otsu_of_empty_is_zero() {
        assert_eq!(otsu_threshold(&[]), 0.0);
    }

    #[test]
    fn percentiles_interpolate_linearly() {
        let values: Vec<f32> = (0..=10).map(|v| v as f32).collect();
        let result = percentiles(values, &[15.0, 75.0, 100.0]).unwrap();
        assert_relative_eq!(result[0], 1.5);
        assert_relative_eq!(result[1], 7.5);
        assert_relative_eq!(result[2], 10.0);
        assert!(percentiles(Vec::new(), &[50.0]).is_none());
    }
}
