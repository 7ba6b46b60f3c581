//! Top-level wiring of the pipeline.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use tokio::task::JoinHandle;
use tracing::{error, info};
use web_time::Instant;

use crate::{
    analysis::{AnalysisResult, ProgressStream, SeriesAnalyzer},
    config::{MeshParams, SegmentationParams, Settings},
    enums::TissueKind,
    error::{Error, Result},
    glb,
    jobs::{GenerationStatus, JobManager, JobTicket},
    scene::{ModelManifest, ModelSummary, SceneAssembler, SlicePlane},
    store::ArtifactStore,
    volume_assembler::VolumeAssembler,
    volume_loader::{SeriesInfo, SeriesSource, SeriesSummary},
};

/// Holds the series provider, the artifact store and the job manager.
///
/// Writes for one series id are expected to be serialised by the caller.
#[derive(Clone)]
pub struct PipelineContext {
    source: Arc<dyn SeriesSource>,
    store: Arc<ArtifactStore>,
    jobs: JobManager,
    slice_params: SegmentationParams,
    volume_params: SegmentationParams,
    mesh_params: MeshParams,
}

impl PipelineContext {
    /// Build a context writing artifacts under `settings`.
    pub fn new(source: Arc<dyn SeriesSource>, settings: Settings) -> Result<Self> {
        Ok(Self {
            source,
            store: Arc::new(ArtifactStore::new(settings)?),
            jobs: JobManager::new(),
            slice_params: SegmentationParams::slice(),
            volume_params: SegmentationParams::volume(),
            mesh_params: MeshParams::default(),
        })
    }

    #[must_use]
    pub fn with_mesh_params(mut self, params: MeshParams) -> Self {
        self.mesh_params = params;
        self
    }

    #[must_use]
    pub fn with_volume_params(mut self, params: SegmentationParams) -> Self {
        self.volume_params = params;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn list_series(&self) -> Vec<SeriesSummary> {
        self.source.list_series()
    }

    fn series_info(&self, series_id: &str) -> Result<SeriesInfo> {
        self.source
            .series_info(series_id)
            .ok_or_else(|| Error::SeriesNotFound(series_id.to_string()))
    }

    fn analyzer(&self) -> SeriesAnalyzer {
        SeriesAnalyzer::new(Arc::clone(&self.source), Arc::clone(&self.store))
            .with_params(self.slice_params)
    }

    /// Drop the model and generation status derived from an older analysis.
    ///
    /// A generation still running for the series keeps blocking new ones
    /// until it returns, and its model is discarded.
    pub fn invalidate_model(&self, series_id: &str) -> Result<()> {
        let had_job = self.jobs.clear(series_id);
        let had_model = self.store.clear_model(series_id)?;
        if had_job || had_model {
            info!(series_id, "Invalidated stale model");
        }
        Ok(())
    }

    /// Analyze every slice of a series.
    ///
    /// Any existing model for the series is deleted first. A failed run
    /// leaves the previously cached analysis in place.
    pub async fn analyze(&self, series_id: &str) -> Result<AnalysisResult> {
        self.series_info(series_id)?;
        self.invalidate_model(series_id)?;
        self.analyzer().analyze(series_id).await
    }

    /// Like [`Self::analyze`], streaming progress events.
    pub fn analyze_streaming(&self, series_id: &str) -> Result<ProgressStream> {
        self.series_info(series_id)?;
        self.invalidate_model(series_id)?;
        Ok(self.analyzer().analyze_streaming(series_id))
    }

    pub fn results(&self, series_id: &str) -> Option<AnalysisResult> {
        self.store.analysis(series_id)
    }

    /// Start generating a model on the blocking pool.
    ///
    /// An empty `tissues` list selects [`TissueKind::DEFAULT_SET`]. Must be
    /// called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SeriesNotFound`] for an unknown series and
    /// [`Error::GenerationAlreadyInProgress`] while a job for the series runs.
    /// The job resolves to [`Error::StaleModel`] if the series is re-analyzed
    /// before it finishes.
    pub fn start_generation(
        &self,
        series_id: &str,
        tissues: &[TissueKind],
    ) -> Result<JoinHandle<Result<ModelManifest>>> {
        let info = self.series_info(series_id)?;
        let ticket = self.jobs.try_start(series_id)?;

        let tissues = if tissues.is_empty() {
            TissueKind::DEFAULT_SET.to_vec()
        } else {
            tissues.to_vec()
        };
        let ctx = self.clone();
        let series_id = series_id.to_string();
        Ok(tokio::task::spawn_blocking(move || {
            ctx.run_generation(&series_id, ticket, &info, &tissues)
        }))
    }

    /// Generate a model and wait for it.
    pub async fn generate_model(
        &self,
        series_id: &str,
        tissues: &[TissueKind],
    ) -> Result<ModelManifest> {
        self.start_generation(series_id, tissues)?.await?
    }

    /// Body of a generation job. Every exit, panics included, leaves the job
    /// in a terminal state.
    fn run_generation(
        &self,
        series_id: &str,
        ticket: JobTicket,
        info: &SeriesInfo,
        tissues: &[TissueKind],
    ) -> Result<ModelManifest> {
        let started = Instant::now();
        info!(series_id, tissues = ?tissues, "Starting model generation");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.generate_blocking(series_id, ticket, info, tissues)
        }))
        .unwrap_or_else(|payload| {
            Err(Error::Worker(format!(
                "model generation panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
        .and_then(|manifest| {
            if self.jobs.complete(series_id, ticket, manifest.clone()) {
                Ok(manifest)
            } else {
                self.store.clear_model(series_id)?;
                Err(Error::StaleModel(series_id.to_string()))
            }
        });

        match outcome {
            Ok(manifest) => {
                info!(
                    series_id,
                    tissues = manifest.tissues.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model generation finished"
                );
                Ok(manifest)
            }
            Err(err) => {
                error!(
                    series_id,
                    %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model generation failed"
                );
                self.jobs.fail(series_id, ticket, err.to_string());
                Err(err)
            }
        }
    }

    fn generate_blocking(
        &self,
        series_id: &str,
        ticket: JobTicket,
        info: &SeriesInfo,
        tissues: &[TissueKind],
    ) -> Result<ModelManifest> {
        let volume = VolumeAssembler::assemble(self.source.slices(series_id)?, info.slice_thickness)?;
        let assembler = SceneAssembler::new(self.volume_params, self.mesh_params);
        let scene = assembler.assemble_with_progress(
            series_id,
            &volume,
            info.image_count,
            tissues,
            |progress| self.jobs.set_progress(series_id, ticket, progress),
        )?;
        if !scene.failures.is_empty() {
            info!(series_id, failed = ?scene.failures, "Some tissues were skipped");
        }
        let bytes = glb::encode(&scene.meshes)?;
        self.jobs.set_progress(series_id, ticket, 95);
        if !self.jobs.is_current(series_id, ticket) {
            return Err(Error::StaleModel(series_id.to_string()));
        }
        self.store.save_model(scene.manifest, &bytes)
    }

    /// Job state, reporting `Complete` for a stored model with no job record.
    pub fn generation_status(&self, series_id: &str) -> GenerationStatus {
        match self.jobs.status(series_id) {
            GenerationStatus::NotStarted => self
                .store
                .model(series_id)
                .map_or(GenerationStatus::NotStarted, |model_info| {
                    GenerationStatus::Complete { model_info }
                }),
            status => status,
        }
    }

    pub fn model(&self, series_id: &str) -> Option<ModelManifest> {
        self.store.model(series_id)
    }

    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.store.list_models()
    }

    /// Axial plane of the stored model, `None` without a model or index.
    pub fn slice_plane(&self, series_id: &str, index: usize) -> Option<SlicePlane> {
        self.store.model(series_id)?.slice_plane(index)
    }

    /// Remove analysis, model and job status of a series.
    pub fn clear_series(&self, series_id: &str) -> Result<()> {
        self.invalidate_model(series_id)?;
        self.store.clear_analysis(series_id)?;
        info!(series_id, "Cleared series artifacts");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
