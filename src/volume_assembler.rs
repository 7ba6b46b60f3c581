use ndarray::{Array3, s};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    volume::{Slice, Volume},
};

pub struct VolumeAssembler;

impl VolumeAssembler {
    /// Stack slices into a volume along z.
    ///
    /// Slices are ordered by their ordering key (stable, so equal keys keep
    /// their input order). The most common (rows, columns) shape wins, ties
    /// going to the shape seen first; slices of any other shape are dropped
    /// and counted in [`Volume::excluded_slices`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientData`] if there are no slices.
    pub fn assemble(mut slices: Vec<Slice>, slice_thickness: Option<f32>) -> Result<Volume> {
        if slices.is_empty() {
            return Err(Error::InsufficientData("no readable slices".to_string()));
        }
        slices.sort_by_key(|slice| slice.order);

        let canonical = Self::majority_shape(&slices);
        let total = slices.len();
        let kept: Vec<Slice> = slices
            .into_iter()
            .filter(|slice| slice.dim() == canonical)
            .collect();
        let excluded = total - kept.len();

        if excluded > 0 {
            warn!(
                kept = kept.len(),
                total,
                excluded,
                rows = canonical.0,
                columns = canonical.1,
                "Excluded slices with non-majority dimensions"
            );
        }

        let (height, width) = canonical;
        let mut data = Array3::<f32>::zeros((kept.len(), height, width));
        for (i, slice) in kept.iter().enumerate() {
            data.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }
        debug!(depth = kept.len(), height, width, "Assembled volume");

        let pixel_spacing = kept.iter().find_map(|slice| slice.pixel_spacing);
        let mut volume = Volume::new(data, pixel_spacing, slice_thickness);
        volume.excluded_slices = excluded;
        Ok(volume)
    }

    fn majority_shape(slices: &[Slice]) -> (usize, usize) {
        let mut counts: Vec<((usize, usize), usize)> = Vec::new();
        for slice in slices {
            let dim = slice.dim();
            match counts.iter_mut().find(|(shape, _)| *shape == dim) {
                Some((_, count)) => *count += 1,
                None => counts.push((dim, 1)),
            }
        }
        // First maximum in first-seen order.
        counts
            .iter()
            .fold(None, |best: Option<((usize, usize), usize)>, &(shape, count)| {
                match best {
                    Some((_, best_count)) if best_count >= count => best,
                    _ => Some((shape, count)),
                }
            })
            .map(|(shape, _)| shape)
            .unwrap_or((0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn slice(rows: usize, cols: usize, order: i32) -> Slice {
        Slice::new(
            Array2::from_elem((rows, cols), order as f32),
            Some((0.8, 0.8)),
            order,
        )
    }

    #[test]
    fn empty_input_is_insufficient() {
        assert!(matches!(
            VolumeAssembler::assemble(Vec::new(), Some(5.0)),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn drops_minority_shapes_and_counts_them() {
        let slices = vec![
            slice(4, 4, 3),
            slice(8, 8, 2),
            slice(4, 4, 1),
            slice(4, 4, 4),
        ];
        let volume = VolumeAssembler::assemble(slices, Some(5.0)).unwrap();
        assert_eq!(volume.dim(), (3, 4, 4));
        assert_eq!(volume.excluded_slices, 1);
        assert_eq!(volume.pixel_spacing, Some((0.8, 0.8)));
        assert_eq!(volume.slice_thickness, Some(5.0));
    }

    #[test]
    fn stacks_in_instance_order() {
        let slices = vec![slice(2, 2, 3), slice(2, 2, 1), slice(2, 2, 2)];
        let volume = VolumeAssembler::assemble(slices, None).unwrap();
        let firsts: Vec<f32> = (0..3).map(|z| volume.data[[z, 0, 0]]).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn tie_goes_to_first_seen_shape() {
        let slices = vec![slice(6, 6, 1), slice(4, 4, 2), slice(6, 6, 3), slice(4, 4, 4)];
        let volume = VolumeAssembler::assemble(slices, None).unwrap();
        assert_eq!(volume.dim(), (2, 6, 6));
    }
}
