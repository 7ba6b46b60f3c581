//! Binary morphology on boolean grids.
//!
//! Grids are `Array3<bool>` indexed (z, y, x). With `Neighborhood::Planar`
//! every z-slice is processed on its own.

use std::collections::VecDeque;

use ndarray::{Array3, Zip};

use crate::enums::Neighborhood;

/// Set of voxel offsets (dz, dy, dx) relative to the element centre.
#[derive(Clone, Debug)]
pub struct StructuringElement {
    offsets: Vec<[isize; 3]>,
}

impl StructuringElement {
    /// Flat disk of the given radius in the y/x plane.
    pub fn disk(radius: usize) -> Self {
        let r = radius as isize;
        let offsets = (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| [0, dy, dx]))
            .filter(|[_, dy, dx]| dy * dy + dx * dx <= r * r)
            .collect();
        Self { offsets }
    }

    pub fn ball(radius: usize) -> Self {
        let r = radius as isize;
        let offsets = (-r..=r)
            .flat_map(|dz| (-r..=r).flat_map(move |dy| (-r..=r).map(move |dx| [dz, dy, dx])))
            .filter(|[dz, dy, dx]| dz * dz + dy * dy + dx * dx <= r * r)
            .collect();
        Self { offsets }
    }

    /// Centre plus its face neighbours.
    pub fn cross(neighborhood: Neighborhood) -> Self {
        let mut offsets = vec![[0, 0, 0]];
        offsets.extend_from_slice(neighbor_offsets(neighborhood));
        Self { offsets }
    }

    /// Disk for planar processing, ball otherwise.
    pub fn round(radius: usize, neighborhood: Neighborhood) -> Self {
        match neighborhood {
            Neighborhood::Planar => Self::disk(radius),
            Neighborhood::Volumetric => Self::ball(radius),
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

const PLANAR_NEIGHBORS: [[isize; 3]; 4] = [[0, -1, 0], [0, 1, 0], [0, 0, -1], [0, 0, 1]];
const VOLUMETRIC_NEIGHBORS: [[isize; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

fn neighbor_offsets(neighborhood: Neighborhood) -> &'static [[isize; 3]] {
    match neighborhood {
        Neighborhood::Planar => &PLANAR_NEIGHBORS,
        Neighborhood::Volumetric => &VOLUMETRIC_NEIGHBORS,
    }
}

#[inline]
fn offset_index(
    (z, y, x): (usize, usize, usize),
    [dz, dy, dx]: [isize; 3],
    (depth, height, width): (usize, usize, usize),
) -> Option<[usize; 3]> {
    let nz = z.checked_add_signed(dz)?;
    let ny = y.checked_add_signed(dy)?;
    let nx = x.checked_add_signed(dx)?;
    (nz < depth && ny < height && nx < width).then_some([nz, ny, nx])
}

pub fn count(mask: &Array3<bool>) -> usize {
    mask.iter().filter(|&&v| v).count()
}

/// Erosion. Voxels outside the grid read as `outside`.
pub fn erode(mask: &Array3<bool>, element: &StructuringElement, outside: bool) -> Array3<bool> {
    let dim = mask.dim();
    let mut out = Array3::from_elem(dim, false);
    Zip::indexed(&mut out).par_for_each(|idx, o| {
        *o = mask[idx]
            && element.offsets.iter().all(|&off| match offset_index(idx, off, dim) {
                Some(n) => mask[n],
                None => outside,
            });
    });
    out
}

/// Dilation with an all-false border.
pub fn dilate(mask: &Array3<bool>, element: &StructuringElement) -> Array3<bool> {
    let dim = mask.dim();
    let mut out = Array3::from_elem(dim, false);
    Zip::indexed(&mut out).par_for_each(|idx, o| {
        *o = element
            .offsets
            .iter()
            .any(|&[dz, dy, dx]| offset_index(idx, [-dz, -dy, -dx], dim).is_some_and(|n| mask[n]));
    });
    out
}

/// Repeated erosion with a border that counts as background, so the mask
/// also shrinks away from the grid edges.
pub fn erode_iterations(
    mask: &Array3<bool>,
    element: &StructuringElement,
    iterations: usize,
) -> Array3<bool> {
    let mut current = mask.clone();
    for _ in 0..iterations {
        if count(&current) == 0 {
            break;
        }
        current = erode(&current, element, false);
    }
    current
}

pub fn opening(mask: &Array3<bool>, element: &StructuringElement) -> Array3<bool> {
    dilate(&erode(mask, element, true), element)
}

pub fn closing(mask: &Array3<bool>, element: &StructuringElement) -> Array3<bool> {
    erode(&dilate(mask, element), element, true)
}

/// Fill background regions not connected to the grid border.
pub fn fill_holes(mask: &Array3<bool>, neighborhood: Neighborhood) -> Array3<bool> {
    let dim @ (depth, height, width) = mask.dim();
    let mut outside = Array3::from_elem(dim, false);
    let mut queue = VecDeque::new();

    for ((z, y, x), &set) in mask.indexed_iter() {
        let on_border = y == 0
            || x == 0
            || y + 1 == height
            || x + 1 == width
            || (neighborhood == Neighborhood::Volumetric && (z == 0 || z + 1 == depth));
        if on_border && !set {
            outside[[z, y, x]] = true;
            queue.push_back((z, y, x));
        }
    }

    let offsets = neighbor_offsets(neighborhood);
    while let Some(idx) = queue.pop_front() {
        for &off in offsets {
            if let Some(n @ [nz, ny, nx]) = offset_index(idx, off, dim)
                && !mask[n]
                && !outside[n]
            {
                outside[n] = true;
                queue.push_back((nz, ny, nx));
            }
        }
    }

    outside.mapv(|v| !v)
}

/// Connected components of a mask.
#[derive(Clone, Debug)]
pub struct Components {
    /// 0 for background, 1..=n for components.
    pub labels: Array3<u32>,
    /// `sizes[i]` is the voxel count of component `i + 1`.
    pub sizes: Vec<usize>,
}

impl Components {
    pub fn largest(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0)
    }
}

pub fn label_components(mask: &Array3<bool>, neighborhood: Neighborhood) -> Components {
    let dim = mask.dim();
    let mut labels = Array3::<u32>::zeros(dim);
    let mut sizes = Vec::new();
    let offsets = neighbor_offsets(neighborhood);
    let mut stack = Vec::new();

    for (start, &set) in mask.indexed_iter() {
        if !set || labels[start] != 0 {
            continue;
        }
        let label = sizes.len() as u32 + 1;
        let mut size = 0;
        labels[start] = label;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            size += 1;
            for &off in offsets {
                if let Some(n @ [nz, ny, nx]) = offset_index(idx, off, dim)
                    && mask[n]
                    && labels[n] == 0
                {
                    labels[n] = label;
                    stack.push((nz, ny, nx));
                }
            }
        }
        sizes.push(size);
    }

    Components { labels, sizes }
}

/// Drop every component with fewer than `min_size` voxels.
pub fn remove_small_components(
    mask: &Array3<bool>,
    components: &Components,
    min_size: usize,
) -> Array3<bool> {
    let keep: Vec<bool> = components.sizes.iter().map(|&s| s >= min_size).collect();
    Zip::from(mask)
        .and(&components.labels)
        .map_collect(|&set, &label| set && label > 0 && keep[label as usize - 1])
}
