//! Per-series tissue analysis with streamed progress.
//!
//! Slices are segmented strictly in order. The heavy per-slice work runs on
//! the blocking pool and the task yields between slices, so a consumer of the
//! event stream is never starved.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::{PROGRESS_CHANNEL_CAPACITY, SegmentationParams},
    error::{Error, Result},
    overlay::OverlayRenderer,
    segmentation::{SegmentationMask, TissueSegmenter},
    statistics::{SliceStatistics, StatisticsAggregator, TissueVolumeStatistics},
    store::ArtifactStore,
    volume::Slice,
    volume_loader::SeriesSource,
};

/// One analyzed slice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedImage {
    pub index: usize,
    pub colored_image_path: String,
    pub stats: SliceStatistics,
}

/// Stored outcome of analysing a series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub series_id: String,
    pub image_count: usize,
    pub analyzed_images: Vec<AnalyzedImage>,
    pub tissue_stats: TissueVolumeStatistics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Progress,
    Complete,
    Error,
}

/// Progress notification. `progress` never decreases within a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    pub total_images: usize,
    pub current_image: usize,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<AnalysisResult>,
}

impl ProgressEvent {
    fn new(kind: EventKind, message: impl Into<String>, total_images: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            total_images,
            current_image: 0,
            progress: 0,
            step: None,
            data: None,
        }
    }

    fn at(mut self, current_image: usize, progress: u8) -> Self {
        self.current_image = current_image;
        self.progress = progress;
        self
    }

    fn step(mut self, step: &str) -> Self {
        self.step = Some(step.to_string());
        self
    }
}

/// Stream of progress events ending with `complete` or `error`.
pub type ProgressStream = BoxStream<'static, ProgressEvent>;

/// Runs the per-slice analysis of one series.
#[derive(Clone)]
pub struct SeriesAnalyzer {
    source: Arc<dyn SeriesSource>,
    store: Arc<ArtifactStore>,
    params: SegmentationParams,
}

struct Outcome {
    index: usize,
    mask: SegmentationMask,
    pixel_spacing: Option<(f32, f32)>,
    colored_image_path: String,
}

impl SeriesAnalyzer {
    pub fn new(source: Arc<dyn SeriesSource>, store: Arc<ArtifactStore>) -> Self {
        Self {
            source,
            store,
            params: SegmentationParams::slice(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: SegmentationParams) -> Self {
        self.params = params;
        self
    }

    /// Analyze `series_id`, discarding progress events.
    pub async fn analyze(&self, series_id: &str) -> Result<AnalysisResult> {
        self.run(series_id, None, &mut 0).await
    }

    /// Spawn the analysis and stream its progress.
    ///
    /// The task stops once the stream is dropped. Must be called within a
    /// tokio runtime.
    pub fn analyze_streaming(&self, series_id: &str) -> ProgressStream {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let analyzer = self.clone();
        let series_id = series_id.to_string();
        tokio::spawn(async move {
            let mut progress = 0;
            if let Err(err) = analyzer.run(&series_id, Some(&tx), &mut progress).await {
                warn!(series_id = %series_id, %err, "Analysis failed");
                let total = analyzer
                    .source
                    .series_info(&series_id)
                    .map_or(0, |info| info.image_count);
                let _ = tx
                    .send(ProgressEvent::new(EventKind::Error, err.to_string(), total).at(0, progress))
                    .await;
            }
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
    }

    /// Run the analysis. Overlays of a run that fails are discarded, leaving
    /// the previously committed analysis untouched.
    async fn run(
        &self,
        series_id: &str,
        tx: Option<&mpsc::Sender<ProgressEvent>>,
        progress: &mut u8,
    ) -> Result<AnalysisResult> {
        let outcome = self.run_slices(series_id, tx, progress).await;
        if outcome.is_err() {
            match self.store.discard_staged_overlays(series_id) {
                Ok(removed) => debug!(series_id, removed, "Discarded staged overlays"),
                Err(err) => warn!(series_id, %err, "Could not discard staged overlays"),
            }
        }
        outcome
    }

    async fn run_slices(
        &self,
        series_id: &str,
        tx: Option<&mpsc::Sender<ProgressEvent>>,
        progress: &mut u8,
    ) -> Result<AnalysisResult> {
        let info = self
            .source
            .series_info(series_id)
            .ok_or_else(|| Error::SeriesNotFound(series_id.to_string()))?;
        let total = info.image_count;
        if total == 0 {
            return Err(Error::InsufficientData(format!(
                "series {series_id} has no images"
            )));
        }
        info!(series_id, total, "Starting analysis");

        emit(tx, ProgressEvent::new(EventKind::Start, "Starting analysis...", total)).await?;

        let mut aggregator = StatisticsAggregator::new(info.pixel_spacing, info.slice_thickness);
        let mut analyzed_images = Vec::with_capacity(total);
        for index in 0..total {
            tokio::task::yield_now().await;
            *progress = ((index as f64 / total as f64) * 100.0).round() as u8;
            emit(
                tx,
                ProgressEvent::new(
                    EventKind::Progress,
                    format!("Analyzing slice {} of {total}", index + 1),
                    total,
                )
                .at(index + 1, *progress)
                .step("segmentation"),
            )
            .await?;

            let Some(slice) = self.source.slice(series_id, index) else {
                warn!(series_id, index, "Skipping unreadable slice");
                continue;
            };
            let outcome = self.analyze_slice(series_id, index, slice).await?;
            let stats = aggregator.add_slice(outcome.index, &outcome.mask, outcome.pixel_spacing);
            analyzed_images.push(AnalyzedImage {
                index: outcome.index,
                colored_image_path: outcome.colored_image_path,
                stats,
            });
        }

        *progress = (*progress).max(95);
        emit(
            tx,
            ProgressEvent::new(EventKind::Progress, "Calculating statistics...", total)
                .at(total, *progress)
                .step("statistics"),
        )
        .await?;

        let result = AnalysisResult {
            series_id: series_id.to_string(),
            image_count: total,
            analyzed_images,
            tissue_stats: aggregator.finish(),
        };
        self.store.commit_analysis(&result)?;
        info!(
            series_id,
            analyzed = result.analyzed_images.len(),
            visceral_cm3 = result.tissue_stats.total_visceral_fat_volume,
            subcutaneous_cm3 = result.tissue_stats.total_subcutaneous_fat_volume,
            "Analysis complete"
        );

        *progress = 100;
        let mut done = ProgressEvent::new(EventKind::Complete, "Analysis complete!", total).at(total, 100);
        done.data = Some(result.clone());
        emit(tx, done).await?;
        Ok(result)
    }

    async fn analyze_slice(&self, series_id: &str, index: usize, slice: Slice) -> Result<Outcome> {
        let segmenter = TissueSegmenter::new(self.params);
        let store = Arc::clone(&self.store);
        let series_id = series_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mask = match segmenter.segment_slice(slice.pixels.view()) {
                Ok(mask) => mask,
                Err(Error::EmptyBody) => {
                    debug!(index, "No body found, slice counted as background");
                    let (rows, cols) = slice.dim();
                    SegmentationMask::background((1, rows, cols))
                }
                Err(err) => return Err(err),
            };
            let labels = mask.labels().index_axis(Axis(0), 0);
            let image = OverlayRenderer::render(slice.pixels.view(), labels)?;
            let path = store.stage_overlay(&series_id, index, &image)?;
            Ok(Outcome {
                index,
                mask,
                pixel_spacing: slice.pixel_spacing,
                colored_image_path: path.display().to_string(),
            })
        })
        .await?
    }
}

/// Send `event` if someone is listening.
///
/// # Errors
///
/// Returns [`Error::Worker`] once the receiver has been dropped, which ends
/// the run.
async fn emit(tx: Option<&mpsc::Sender<ProgressEvent>>, event: ProgressEvent) -> Result<()> {
    match tx {
        Some(tx) => tx
            .send(event)
            .await
            .map_err(|_| Error::Worker("progress listener went away".to_string())),
        None => Ok(()),
    }
}
