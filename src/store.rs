//! On-disk artifacts with in-memory caches.
//!
//! Layout under [`Settings::assets_dir`]:
//!
//! ```text
//! images/<series>_analysis.json
//! images/<series>_analyzed_<index:04>.png
//! images/<series>_analyzed_<index:04>.staged.png   (until committed)
//! models/<series>_model.glb
//! models/<series>_model_info.json
//! ```

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use image::{ImageFormat, RgbImage};
use tracing::{debug, info, warn};

use crate::{
    analysis::AnalysisResult,
    config::Settings,
    error::Result,
    scene::{ModelManifest, ModelSummary},
};

const ANALYSIS_SUFFIX: &str = "_analysis.json";
const MANIFEST_SUFFIX: &str = "_model_info.json";
const STAGED_SUFFIX: &str = ".staged.png";

pub struct ArtifactStore {
    settings: Settings,
    analyses: Mutex<HashMap<String, AnalysisResult>>,
    models: Mutex<HashMap<String, ModelManifest>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

impl ArtifactStore {
    /// Open the store, creating its directories.
    pub fn new(settings: Settings) -> Result<Self> {
        settings.ensure_dirs()?;
        Ok(Self {
            settings,
            analyses: Mutex::default(),
            models: Mutex::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn analysis_path(&self, series_id: &str) -> PathBuf {
        self.settings
            .images_dir()
            .join(format!("{series_id}{ANALYSIS_SUFFIX}"))
    }

    pub fn overlay_path(&self, series_id: &str, index: usize) -> PathBuf {
        self.settings
            .images_dir()
            .join(format!("{series_id}_analyzed_{index:04}.png"))
    }

    pub fn glb_path(&self, series_id: &str) -> PathBuf {
        self.settings
            .models_dir()
            .join(format!("{series_id}_model.glb"))
    }

    pub fn manifest_path(&self, series_id: &str) -> PathBuf {
        self.settings
            .models_dir()
            .join(format!("{series_id}{MANIFEST_SUFFIX}"))
    }

    fn staged_overlay_path(&self, series_id: &str, index: usize) -> PathBuf {
        self.settings
            .images_dir()
            .join(format!("{series_id}_analyzed_{index:04}{STAGED_SUFFIX}"))
    }

    /// Write an overlay beside its final path. It replaces the published
    /// overlay only when the analysis is committed.
    ///
    /// Returns the path the overlay will have once committed.
    pub fn stage_overlay(&self, series_id: &str, index: usize, image: &RgbImage) -> Result<PathBuf> {
        image.save_with_format(self.staged_overlay_path(series_id, index), ImageFormat::Png)?;
        Ok(self.overlay_path(series_id, index))
    }

    /// Remove overlays staged by a run that did not complete.
    pub fn discard_staged_overlays(&self, series_id: &str) -> Result<usize> {
        let prefix = format!("{series_id}_analyzed_");
        let mut removed = 0;
        for entry in fs::read_dir(self.settings.images_dir())? {
            let path = entry?.path();
            let is_staged = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(STAGED_SUFFIX));
            if is_staged && remove_if_exists(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Persist a completed analysis, then publish its staged overlays.
    pub fn commit_analysis(&self, result: &AnalysisResult) -> Result<()> {
        self.save_analysis(result)?;
        for image in &result.analyzed_images {
            fs::rename(
                self.staged_overlay_path(&result.series_id, image.index),
                self.overlay_path(&result.series_id, image.index),
            )?;
        }
        Ok(())
    }

    /// Persist a completed analysis and make it the cached result.
    pub fn save_analysis(&self, result: &AnalysisResult) -> Result<()> {
        let path = self.analysis_path(&result.series_id);
        fs::write(&path, serde_json::to_vec_pretty(result)?)?;
        locked(&self.analyses).insert(result.series_id.clone(), result.clone());
        debug!(path = %path.display(), "Saved analysis");
        Ok(())
    }

    /// Cached analysis, falling back to the JSON file on disk.
    pub fn analysis(&self, series_id: &str) -> Option<AnalysisResult> {
        if let Some(result) = locked(&self.analyses).get(series_id) {
            return Some(result.clone());
        }
        let bytes = fs::read(self.analysis_path(series_id)).ok()?;
        match serde_json::from_slice::<AnalysisResult>(&bytes) {
            Ok(result) => {
                locked(&self.analyses).insert(series_id.to_string(), result.clone());
                Some(result)
            }
            Err(err) => {
                warn!(series_id, %err, "Ignoring unreadable analysis file");
                None
            }
        }
    }

    /// Write the GLB scene and its manifest, returning the stored manifest.
    pub fn save_model(&self, mut manifest: ModelManifest, glb: &[u8]) -> Result<ModelManifest> {
        let glb_path = self.glb_path(&manifest.series_id);
        fs::write(&glb_path, glb)?;
        manifest.glb_path = Some(glb_path.display().to_string());
        fs::write(
            self.manifest_path(&manifest.series_id),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        locked(&self.models).insert(manifest.series_id.clone(), manifest.clone());
        Ok(manifest)
    }

    /// Cached manifest, falling back to the JSON file on disk.
    pub fn model(&self, series_id: &str) -> Option<ModelManifest> {
        if let Some(manifest) = locked(&self.models).get(series_id) {
            return Some(manifest.clone());
        }
        let bytes = fs::read(self.manifest_path(series_id)).ok()?;
        let manifest: ModelManifest = serde_json::from_slice(&bytes).ok()?;
        locked(&self.models).insert(series_id.to_string(), manifest.clone());
        Some(manifest)
    }

    /// Known models, ordered by series id.
    pub fn list_models(&self) -> Vec<ModelSummary> {
        let mut summaries: Vec<ModelSummary> = locked(&self.models)
            .values()
            .map(ModelManifest::summary)
            .collect();
        summaries.sort_by(|a, b| a.series_id.cmp(&b.series_id));
        summaries
    }

    /// Delete the model files and cache entry. Returns whether anything existed.
    pub fn clear_model(&self, series_id: &str) -> Result<bool> {
        let cached = locked(&self.models).remove(series_id).is_some();
        let glb = remove_if_exists(&self.glb_path(series_id))?;
        let manifest = remove_if_exists(&self.manifest_path(series_id))?;
        Ok(cached || glb || manifest)
    }

    /// Delete the analysis record, its overlays and the cache entry.
    pub fn clear_analysis(&self, series_id: &str) -> Result<()> {
        locked(&self.analyses).remove(series_id);
        remove_if_exists(&self.analysis_path(series_id))?;
        let prefix = format!("{series_id}_analyzed_");
        for entry in fs::read_dir(self.settings.images_dir())? {
            let path = entry?.path();
            let is_overlay = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".png"));
            if is_overlay {
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }

    /// Load analysis records and manifests left by earlier runs.
    ///
    /// Returns the number of (analyses, models) loaded. Unreadable files are
    /// skipped.
    pub fn scan_existing(&self) -> Result<(usize, usize)> {
        let mut analyses = 0;
        for series_id in Self::series_with_suffix(&self.settings.images_dir(), ANALYSIS_SUFFIX)? {
            if self.analysis(&series_id).is_some() {
                analyses += 1;
            }
        }
        let mut models = 0;
        for series_id in Self::series_with_suffix(&self.settings.models_dir(), MANIFEST_SUFFIX)? {
            if self.model(&series_id).is_some() {
                models += 1;
            }
        }
        info!(analyses, models, "Loaded existing artifacts");
        Ok((analyses, models))
    }

    fn series_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(suffix)) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzedImage;
    use crate::statistics::{SliceStatistics, TissueVolumeStatistics};
    use tempfile::TempDir;

    fn store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(Settings::new(dir.path())).unwrap();
        (dir, store)
    }

    fn result(series_id: &str) -> AnalysisResult {
        AnalysisResult {
            series_id: series_id.to_string(),
            image_count: 2,
            analyzed_images: vec![],
            tissue_stats: TissueVolumeStatistics::default(),
        }
    }

    fn manifest(series_id: &str) -> ModelManifest {
        ModelManifest {
            series_id: series_id.to_string(),
            tissues: vec![],
            slice_count: 5,
            dimensions: [5, 16, 16],
            voxel_spacing: [1.0, 1.0, 1.0],
            glb_path: None,
        }
    }

    fn with_overlay(store: &ArtifactStore, series_id: &str, index: usize) -> AnalysisResult {
        let image = RgbImage::new(4, 4);
        let path = store.stage_overlay(series_id, index, &image).unwrap();
        let mut result = result(series_id);
        result.analyzed_images.push(AnalyzedImage {
            index,
            colored_image_path: path.display().to_string(),
            stats: SliceStatistics {
                index,
                visceral_fat_pixels: 0,
                subcutaneous_fat_pixels: 0,
                visceral_fat_area_cm2: 0.0,
            },
        });
        result
    }

    #[test]
    fn analysis_survives_a_restart() {
        let (dir, first) = store();
        first.save_analysis(&result("s1")).unwrap();
        assert!(first.analysis_path("s1").exists());

        let second = ArtifactStore::new(Settings::new(dir.path())).unwrap();
        assert_eq!(second.scan_existing().unwrap(), (1, 0));
        assert_eq!(second.analysis("s1"), Some(result("s1")));
    }

    #[test]
    fn model_files_are_written_and_cleared() {
        let (_dir, store) = store();
        let saved = store.save_model(manifest("s1"), b"glTF").unwrap();
        assert!(saved.glb_path.is_some());
        assert!(store.glb_path("s1").exists());
        assert_eq!(store.list_models().len(), 1);

        assert!(store.clear_model("s1").unwrap());
        assert!(!store.manifest_path("s1").exists());
        assert!(store.model("s1").is_none());
        assert!(!store.clear_model("s1").unwrap());
    }

    #[test]
    fn clearing_analysis_removes_overlays() {
        let (_dir, store) = store();
        let image = RgbImage::new(4, 4);
        store.commit_analysis(&with_overlay(&store, "s1", 3)).unwrap();
        store.commit_analysis(&with_overlay(&store, "s2", 0)).unwrap();
        store.stage_overlay("s1", 4, &image).unwrap();
        let removed = store.overlay_path("s1", 3);
        let kept = store.overlay_path("s2", 0);
        assert!(removed.ends_with("s1_analyzed_0003.png"));

        store.clear_analysis("s1").unwrap();
        assert!(!removed.exists());
        assert!(!store.staged_overlay_path("s1", 4).exists());
        assert!(kept.exists());
        assert!(store.analysis("s1").is_none());
    }

    #[test]
    fn staged_overlays_are_published_only_on_commit() {
        let (_dir, store) = store();
        let published = with_overlay(&store, "s1", 0);
        store.commit_analysis(&published).unwrap();
        let before = fs::read(store.overlay_path("s1", 0)).unwrap();

        let replacement = RgbImage::from_pixel(8, 8, image::Rgb([255, 0, 0]));
        let path = store.stage_overlay("s1", 0, &replacement).unwrap();
        assert_eq!(path, store.overlay_path("s1", 0));
        assert_eq!(fs::read(&path).unwrap(), before);

        assert_eq!(store.discard_staged_overlays("s1").unwrap(), 1);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(store.analysis("s1"), Some(published));
    }
}
