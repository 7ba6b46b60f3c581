//! Series access: the DICOM library and an in-memory stand-in.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, s};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    enums::SortBy,
    error::{Error, Result},
    volume::Slice,
};

/// Listing entry for a loaded series.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub series_uid: String,
    pub series_description: String,
    pub modality: String,
    pub image_count: usize,
}

/// Series metadata needed by the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SeriesInfo {
    pub series_uid: String,
    pub series_description: String,
    pub modality: String,
    pub patient_name: String,
    pub study_date: String,
    pub image_count: usize,
    pub rows: usize,
    pub columns: usize,
    /// (row, column) spacing in mm.
    pub pixel_spacing: Option<(f32, f32)>,
    pub slice_thickness: Option<f32>,
}

/// Provider of per-slice intensity arrays in physical units.
pub trait SeriesSource: Send + Sync {
    fn list_series(&self) -> Vec<SeriesSummary>;

    fn series_info(&self, series_id: &str) -> Option<SeriesInfo>;

    /// Slice `index` in instance order, `None` if missing or unreadable.
    fn slice(&self, series_id: &str, index: usize) -> Option<Slice>;

    /// Every readable slice of the series, in instance order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SeriesNotFound`] for an unknown series.
    fn slices(&self, series_id: &str) -> Result<Vec<Slice>> {
        let info = self
            .series_info(series_id)
            .ok_or_else(|| Error::SeriesNotFound(series_id.to_string()))?;
        Ok((0..info.image_count)
            .filter_map(|index| self.slice(series_id, index))
            .collect())
    }
}

type DicomFile = FileDicomObject<InMemDicomObject>;

/// DICOM files grouped by Series Instance UID.
#[derive(Default)]
pub struct DicomLibrary {
    series: BTreeMap<String, Vec<DicomFile>>,
}

impl DicomLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every readable DICOM file below `path`.
    ///
    /// Files that fail to parse are skipped, as are `.zip` archives. Files are
    /// parsed in parallel.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be walked.
    pub fn load_from_directory(path: impl AsRef<Path>, sort_by: SortBy) -> Result<Self> {
        let mut library = Self::new();
        library.add_directory(path, sort_by)?;
        Ok(library)
    }

    /// Add the files below `path` to the library, returning the touched series ids.
    pub fn add_directory(&mut self, path: impl AsRef<Path>, sort_by: SortBy) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        collect_files(path.as_ref(), &mut paths)?;
        paths.sort();

        let objects: Vec<(String, DicomFile)> = paths
            .par_iter()
            .filter_map(|path| {
                let object = open_file(path).ok()?;
                let uid = read_string(&object, tags::SERIES_INSTANCE_UID).unwrap_or_else(|| {
                    path.file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                        .unwrap_or_default()
                });
                Some((uid, object))
            })
            .collect();

        let mut touched = Vec::new();
        for (uid, object) in objects {
            if !touched.contains(&uid) {
                touched.push(uid.clone());
            }
            self.series.entry(uid).or_default().push(object);
        }
        for uid in &touched {
            if let Some(objects) = self.series.get_mut(uid) {
                sort_objects(objects, sort_by);
            }
        }
        info!(
            files = paths.len(),
            series = touched.len(),
            "Loaded DICOM directory {}",
            path.as_ref().display()
        );
        Ok(touched)
    }

    pub fn remove_series(&mut self, series_id: &str) -> bool {
        self.series.remove(series_id).is_some()
    }

    fn describe(index: usize, object: &DicomFile) -> (String, String) {
        let modality =
            read_string(object, tags::MODALITY).unwrap_or_else(|| "Unknown".to_string());
        let description = read_string(object, tags::SERIES_DESCRIPTION)
            .unwrap_or_else(|| format!("{modality} Series {}", index + 1));
        (description, modality)
    }
}

impl SeriesSource for DicomLibrary {
    fn list_series(&self) -> Vec<SeriesSummary> {
        self.series
            .iter()
            .filter(|(_, objects)| !objects.is_empty())
            .enumerate()
            .map(|(index, (uid, objects))| {
                let (series_description, modality) = Self::describe(index, &objects[0]);
                SeriesSummary {
                    series_uid: uid.clone(),
                    series_description,
                    modality,
                    image_count: objects.len(),
                }
            })
            .collect()
    }

    fn series_info(&self, series_id: &str) -> Option<SeriesInfo> {
        let (index, objects) = self
            .series
            .iter()
            .filter(|(_, objects)| !objects.is_empty())
            .enumerate()
            .find(|(_, (uid, _))| uid.as_str() == series_id)
            .map(|(index, (_, objects))| (index, objects))?;
        let first = &objects[0];
        let (series_description, modality) = Self::describe(index, first);

        Some(SeriesInfo {
            series_uid: series_id.to_string(),
            series_description,
            modality,
            patient_name: read_string(first, tags::PATIENT_NAME)
                .unwrap_or_else(|| "Unknown".to_string()),
            study_date: read_string(first, tags::STUDY_DATE)
                .unwrap_or_else(|| "Unknown".to_string()),
            image_count: objects.len(),
            rows: read_int(first, tags::ROWS).unwrap_or(0).max(0) as usize,
            columns: read_int(first, tags::COLUMNS).unwrap_or(0).max(0) as usize,
            pixel_spacing: read_pixel_spacing(first),
            slice_thickness: read_float(first, tags::SLICE_THICKNESS),
        })
    }

    fn slice(&self, series_id: &str, index: usize) -> Option<Slice> {
        let object = self.series.get(series_id)?.get(index)?;
        let pixels = decode_image(object)?;
        let order = read_int(object, tags::INSTANCE_NUMBER).unwrap_or(index as i32);
        Some(Slice::new(pixels, read_pixel_spacing(object), order))
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if !path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn sort_objects(objects: &mut [DicomFile], sort_by: SortBy) {
    let key = |object: &DicomFile| -> f32 {
        match sort_by {
            SortBy::InstanceNumber => read_int(object, tags::INSTANCE_NUMBER).unwrap_or(0) as f32,
            SortBy::ImagePositionPatient => object
                .element(tags::IMAGE_POSITION_PATIENT)
                .ok()
                .and_then(|element| element.to_multi_float32().ok())
                .and_then(|position| position.get(2).copied())
                .unwrap_or(0.0),
            SortBy::None => 0.0,
        }
    };
    if !matches!(sort_by, SortBy::None) {
        objects.sort_by(|a, b| key(a).total_cmp(&key(b)));
    }
}

/// Decode the first frame with the modality LUT applied and no VOI windowing.
fn decode_image(object: &DicomFile) -> Option<Array2<f32>> {
    let pixel_data = object.decode_pixel_data().ok()?;
    let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
    let image = pixel_data
        .to_ndarray_with_options::<f32>(&options)
        .ok()
        .map(|arr| arr.slice_move(s![0, .., .., 0]));
    if image.is_none() {
        debug!("Skipping slice with undecodable pixel data");
    }
    image
}

fn read_string(object: &DicomFile, tag: dicom::core::Tag) -> Option<String> {
    let value = object.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!value.is_empty()).then(|| value.to_string())
}

fn read_int(object: &DicomFile, tag: dicom::core::Tag) -> Option<i32> {
    object.element(tag).ok()?.to_int::<i32>().ok()
}

fn read_float(object: &DicomFile, tag: dicom::core::Tag) -> Option<f32> {
    object.element(tag).ok()?.to_float32().ok()
}

fn read_pixel_spacing(object: &DicomFile) -> Option<(f32, f32)> {
    let spacing = object
        .element(tags::PIXEL_SPACING)
        .ok()?
        .to_multi_float32()
        .ok()?;
    match spacing.as_slice() {
        [row, column, ..] => Some((*row, *column)),
        _ => None,
    }
}

/// Series held in memory, for embedding and tests.
#[derive(Default)]
pub struct InMemorySource {
    series: BTreeMap<String, (SeriesInfo, Vec<Slice>)>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a series. Slices are kept in ordering-key order.
    pub fn insert(
        &mut self,
        series_id: impl Into<String>,
        mut slices: Vec<Slice>,
        slice_thickness: Option<f32>,
    ) {
        let series_uid = series_id.into();
        slices.sort_by_key(|slice| slice.order);
        let (rows, columns) = slices.first().map(Slice::dim).unwrap_or((0, 0));
        let info = SeriesInfo {
            series_uid: series_uid.clone(),
            series_description: "In-memory series".to_string(),
            modality: "MR".to_string(),
            patient_name: "Unknown".to_string(),
            study_date: "Unknown".to_string(),
            image_count: slices.len(),
            rows,
            columns,
            pixel_spacing: slices.iter().find_map(|slice| slice.pixel_spacing),
            slice_thickness,
        };
        self.series.insert(series_uid, (info, slices));
    }

    #[must_use]
    pub fn with_series(
        mut self,
        series_id: impl Into<String>,
        slices: Vec<Slice>,
        slice_thickness: Option<f32>,
    ) -> Self {
        self.insert(series_id, slices, slice_thickness);
        self
    }
}

impl SeriesSource for InMemorySource {
    fn list_series(&self) -> Vec<SeriesSummary> {
        self.series
            .values()
            .map(|(info, _)| SeriesSummary {
                series_uid: info.series_uid.clone(),
                series_description: info.series_description.clone(),
                modality: info.modality.clone(),
                image_count: info.image_count,
            })
            .collect()
    }

    fn series_info(&self, series_id: &str) -> Option<SeriesInfo> {
        self.series.get(series_id).map(|(info, _)| info.clone())
    }

    fn slice(&self, series_id: &str, index: usize) -> Option<Slice> {
        self.series.get(series_id)?.1.get(index).cloned()
    }
}
