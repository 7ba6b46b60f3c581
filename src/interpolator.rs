use ndarray::{Array3, Zip};

use crate::volume::VoxelSpacing;

/// A volume shrunk to fit the mesh-generation budget.
#[derive(Clone, Debug)]
pub struct Downsampled {
    pub data: Array3<f32>,
    /// Shrink factor applied to every axis, 1.0 when untouched.
    pub factor: f32,
    pub spacing: VoxelSpacing,
}

pub struct Interpolator;

impl Interpolator {
    /// `max_dim / target` when the largest dimension exceeds `target`, else 1.
    pub fn downsample_factor(dim: (usize, usize, usize), target: usize) -> f32 {
        let max_dim = dim.0.max(dim.1).max(dim.2);
        if target == 0 || max_dim <= target {
            1.0
        } else {
            max_dim as f32 / target as f32
        }
    }

    /// Isotropically downsample so the largest dimension is about `target`,
    /// scaling spacing by the same factor to keep the physical extent.
    pub fn downsample(data: &Array3<f32>, spacing: VoxelSpacing, target: usize) -> Downsampled {
        let factor = Self::downsample_factor(data.dim(), target);
        if factor <= 1.0 {
            return Downsampled {
                data: data.clone(),
                factor: 1.0,
                spacing,
            };
        }
        Downsampled {
            data: Self::zoom(data, 1.0 / factor),
            factor,
            spacing: spacing.scaled(factor),
        }
    }

    /// Output shape of a zoom, never collapsing an axis to zero.
    pub fn zoomed_dim(dim: (usize, usize, usize), zoom: f32) -> (usize, usize, usize) {
        let axis = |n: usize| ((n as f32 * zoom).round() as usize).max(1);
        (axis(dim.0), axis(dim.1), axis(dim.2))
    }

    /// Trilinear resampling. Corner samples map onto corner samples.
    pub fn zoom(data: &Array3<f32>, zoom: f32) -> Array3<f32> {
        let src_dim = data.dim();
        let dst_dim = Self::zoomed_dim(src_dim, zoom);
        let ratio = |src: usize, dst: usize| {
            if dst > 1 {
                (src - 1) as f32 / (dst - 1) as f32
            } else {
                0.0
            }
        };
        let (rz, ry, rx) = (
            ratio(src_dim.0, dst_dim.0),
            ratio(src_dim.1, dst_dim.1),
            ratio(src_dim.2, dst_dim.2),
        );

        let mut out = Array3::<f32>::zeros(dst_dim);
        Zip::indexed(&mut out).par_for_each(|(z, y, x), o| {
            *o = Self::trilinear_interpolate(data, z as f32 * rz, y as f32 * ry, x as f32 * rx);
        });
        out
    }

    #[inline]
    pub(crate) fn trilinear_interpolate(volume: &Array3<f32>, z: f32, y: f32, x: f32) -> f32 {
        let (depth, height, width) = volume.dim();

        let z0 = (z.floor() as usize).min(depth - 1);
        let y0 = (y.floor() as usize).min(height - 1);
        let x0 = (x.floor() as usize).min(width - 1);
        let z1 = (z0 + 1).min(depth - 1);
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dz = z - z0 as f32;
        let dy = y - y0 as f32;
        let dx = x - x0 as f32;

        let lerp = |a: f32, b: f32, t: f32| a.mul_add(1.0 - t, b * t);

        let c00 = lerp(volume[[z0, y0, x0]], volume[[z0, y0, x1]], dx);
        let c01 = lerp(volume[[z0, y1, x0]], volume[[z0, y1, x1]], dx);
        let c10 = lerp(volume[[z1, y0, x0]], volume[[z1, y0, x1]], dx);
        let c11 = lerp(volume[[z1, y1, x0]], volume[[z1, y1, x1]], dx);

        lerp(lerp(c00, c01, dy), lerp(c10, c11, dy), dz)
    }
}
