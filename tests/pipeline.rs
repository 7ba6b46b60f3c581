use std::sync::{Arc, Mutex, mpsc};

use ndarray::Array2;
use tempfile::TempDir;
use tissue_volume::{
    Error, InMemorySource, PipelineContext, Result, SeriesSource, Settings, TissueKind,
    config::MeshParams,
    jobs::GenerationStatus,
    volume::Slice,
    volume_loader::{SeriesInfo, SeriesSummary},
};

const SIZE: usize = 128;
const SLICES: i32 = 6;

/// Abdomen-like cross-section: bright subcutaneous ring, bright central blob,
/// and a ramp of mid intensities in between.
fn phantom_slice(order: i32) -> Slice {
    let c = (SIZE / 2) as f32;
    let pixels = Array2::from_shape_fn((SIZE, SIZE), |(y, x)| {
        let r = ((y as f32 - c).powi(2) + (x as f32 - c).powi(2)).sqrt();
        if r >= 50.0 {
            0.0
        } else if r >= 45.0 || r < 8.0 {
            200.0
        } else {
            80.0 + 60.0 * (x as f32 / SIZE as f32)
        }
    });
    Slice::new(pixels, Some((1.0, 1.0)), order)
}

fn phantom_source() -> InMemorySource {
    InMemorySource::new().with_series(
        "phantom",
        (0..SLICES).map(phantom_slice).collect(),
        Some(2.0),
    )
}

fn context(dir: &TempDir) -> PipelineContext {
    PipelineContext::new(Arc::new(phantom_source()), Settings::new(dir.path())).unwrap()
}

/// Holds every volume read until the test lets it through.
struct GatedSource {
    inner: InMemorySource,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl SeriesSource for GatedSource {
    fn list_series(&self) -> Vec<SeriesSummary> {
        self.inner.list_series()
    }

    fn series_info(&self, series_id: &str) -> Option<SeriesInfo> {
        self.inner.series_info(series_id)
    }

    fn slice(&self, series_id: &str, index: usize) -> Option<Slice> {
        self.inner.slice(series_id, index)
    }

    fn slices(&self, series_id: &str) -> Result<Vec<Slice>> {
        self.gate.lock().unwrap().recv().unwrap();
        self.inner.slices(series_id)
    }
}

/// Panics whenever a volume is read.
struct PanickingSource(InMemorySource);

impl SeriesSource for PanickingSource {
    fn list_series(&self) -> Vec<SeriesSummary> {
        self.0.list_series()
    }

    fn series_info(&self, series_id: &str) -> Option<SeriesInfo> {
        self.0.series_info(series_id)
    }

    fn slice(&self, series_id: &str, index: usize) -> Option<Slice> {
        self.0.slice(series_id, index)
    }

    fn slices(&self, _series_id: &str) -> Result<Vec<Slice>> {
        panic!("decoder crashed");
    }
}

#[tokio::test]
async fn analysis_reports_fat_statistics() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let result = ctx.analyze("phantom").await.unwrap();

    assert_eq!(result.image_count, SLICES as usize);
    assert_eq!(result.analyzed_images.len(), SLICES as usize);
    let stats = &result.tissue_stats;
    assert!(stats.total_visceral_fat_volume > 0.0);
    assert!(stats.visceral_fat_percentage >= 0.0 && stats.visceral_fat_percentage <= 100.0);
    assert_eq!(ctx.results("phantom"), Some(result));
}

#[tokio::test]
async fn model_is_generated_and_queryable() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    ctx.analyze("phantom").await.unwrap();

    let manifest = ctx
        .generate_model("phantom", &TissueKind::DEFAULT_SET)
        .await
        .unwrap();
    assert!(manifest.tissues.iter().any(|t| t.name == "body"));
    assert_eq!(manifest.slice_count, SLICES as usize);
    assert_eq!(manifest.dimensions, [SLICES as usize, SIZE, SIZE]);
    let glb = std::fs::read(manifest.glb_path.as_deref().unwrap()).unwrap();
    assert_eq!(&glb[0..4], b"glTF");

    assert!(matches!(
        ctx.generation_status("phantom"),
        GenerationStatus::Complete { .. }
    ));
    assert_eq!(ctx.list_models().len(), 1);

    // Thickness 2.0 mm scaled by 0.55.
    let plane = ctx.slice_plane("phantom", 3).unwrap();
    assert!((plane.z_position - 3.3).abs() < 1e-4);
    assert_eq!(plane.width, SIZE as f32);
    assert_eq!(plane.normal, [0.0, 0.0, 1.0]);
    assert!(ctx.slice_plane("phantom", SLICES as usize).is_none());
}

#[tokio::test]
async fn reanalysis_deletes_the_stale_model() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    ctx.analyze("phantom").await.unwrap();
    let manifest = ctx.generate_model("phantom", &[TissueKind::Body]).await.unwrap();
    let glb_path = manifest.glb_path.unwrap();

    ctx.analyze("phantom").await.unwrap();
    assert!(ctx.model("phantom").is_none());
    assert_eq!(ctx.generation_status("phantom"), GenerationStatus::NotStarted);
    assert!(!std::path::Path::new(&glb_path).exists());
}

#[tokio::test]
async fn concurrent_generation_is_rejected() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let first = ctx.start_generation("phantom", &[TissueKind::Body]).unwrap();
    let second = ctx.start_generation("phantom", &[TissueKind::Body]);
    assert!(matches!(
        second,
        Err(Error::GenerationAlreadyInProgress(id)) if id == "phantom"
    ));
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn reanalysis_during_generation_discards_the_running_model() {
    let dir = TempDir::new().unwrap();
    let (release, gate) = mpsc::channel();
    let source = GatedSource {
        inner: phantom_source(),
        gate: Mutex::new(gate),
    };
    let ctx = PipelineContext::new(Arc::new(source), Settings::new(dir.path())).unwrap();

    let first = ctx.start_generation("phantom", &[TissueKind::Body]).unwrap();
    ctx.analyze("phantom").await.unwrap();
    assert!(matches!(
        ctx.start_generation("phantom", &[TissueKind::Body]),
        Err(Error::GenerationAlreadyInProgress(id)) if id == "phantom"
    ));

    release.send(()).unwrap();
    assert!(matches!(
        first.await.unwrap(),
        Err(Error::StaleModel(id)) if id == "phantom"
    ));
    assert!(ctx.model("phantom").is_none());
    assert_eq!(ctx.generation_status("phantom"), GenerationStatus::NotStarted);

    release.send(()).unwrap();
    let manifest = ctx.generate_model("phantom", &[TissueKind::Body]).await.unwrap();
    assert_eq!(ctx.model("phantom"), Some(manifest));
}

#[tokio::test]
async fn panicking_generation_ends_in_error() {
    let dir = TempDir::new().unwrap();
    let source = PanickingSource(phantom_source());
    let ctx = PipelineContext::new(Arc::new(source), Settings::new(dir.path())).unwrap();

    let err = ctx.generate_model("phantom", &[]).await.unwrap_err();
    assert!(matches!(&err, Error::Worker(message) if message.contains("decoder crashed")));
    match ctx.generation_status("phantom") {
        GenerationStatus::Error { message } => assert!(message.contains("panicked")),
        other => panic!("unexpected status: {other:?}"),
    }

    let retry = ctx.start_generation("phantom", &[]).unwrap();
    assert!(retry.await.unwrap().is_err());
}

#[tokio::test]
async fn failed_generation_is_reported_as_error() {
    let dir = TempDir::new().unwrap();
    let params = MeshParams {
        min_voxels: usize::MAX,
        ..MeshParams::default()
    };
    let ctx = context(&dir).with_mesh_params(params);

    let err = ctx
        .generate_model("phantom", &[TissueKind::Body, TissueKind::Organs])
        .await
        .unwrap_err();
    match &err {
        Error::NoUsableMeshes(failures) => {
            assert_eq!(
                failures,
                &vec![
                    "body (no valid geometry)".to_string(),
                    "organs (no valid geometry)".to_string()
                ]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    match ctx.generation_status("phantom") {
        GenerationStatus::Error { message } => {
            assert!(message.starts_with("No meshes could be generated"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
}

#[tokio::test]
async fn stored_model_is_found_after_restart() {
    let dir = TempDir::new().unwrap();
    context(&dir)
        .generate_model("phantom", &[TissueKind::Body])
        .await
        .unwrap();

    let restarted = context(&dir);
    assert_eq!(restarted.store().scan_existing().unwrap(), (0, 1));
    assert!(matches!(
        restarted.generation_status("phantom"),
        GenerationStatus::Complete { .. }
    ));
}

#[tokio::test]
async fn unknown_series_is_not_found() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    assert!(matches!(
        ctx.analyze("nope").await,
        Err(Error::SeriesNotFound(_))
    ));
    assert!(matches!(
        ctx.start_generation("nope", &[]),
        Err(Error::SeriesNotFound(_))
    ));
    assert_eq!(ctx.generation_status("nope"), GenerationStatus::NotStarted);
}
