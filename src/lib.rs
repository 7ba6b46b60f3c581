//! # Tissue-volume library
//!
//! This crate turns a DICOM series into per-slice tissue statistics and a
//! multi-tissue 3D surface model.
//!
//! Slices are read through a [`SeriesSource`] (the DICOM-backed
//! [`DicomLibrary`] or an [`InMemorySource`]) and processed along two paths:
//!
//!  - Analysis: every slice is segmented on its own into visceral fat,
//!    subcutaneous fat and organ/muscle. A color overlay is rendered per slice
//!    and pixel counts are converted into areas and volumes.
//!  - Model generation: the slices are stacked into a volume, downsampled to
//!    a fixed budget, segmented in 3D and each requested tissue is meshed
//!    (iso-surface, Laplacian smoothing, quadric decimation). The meshes are
//!    exported as one GLB scene with a JSON manifest.
//!
//! Segmentation uses adaptive thresholds: Otsu for the body outline, then
//! intensity percentiles inside the body for fat and organ/muscle. Fat is
//! split into subcutaneous and visceral by eroding the body inward.
//!
//! Re-analysing a series deletes any model generated from the previous
//! analysis. Only one model generation per series may run at a time.
//!
//! # Examples
//!
//! ## Analyzing a folder of DICOM files
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tissue_volume::{DicomLibrary, PipelineContext, Settings, SortBy, TissueKind};
//! # async fn run() -> tissue_volume::Result<()> {
//! let library = DicomLibrary::load_from_directory("dicom", SortBy::InstanceNumber)?;
//! let ctx = PipelineContext::new(Arc::new(library), Settings::new("assets"))?;
//! let series_id = ctx.list_series()[0].series_uid.clone();
//!
//! let analysis = ctx.analyze(&series_id).await?;
//! println!("visceral fat: {} cm³", analysis.tissue_stats.total_visceral_fat_volume);
//!
//! let model = ctx.generate_model(&series_id, &TissueKind::DEFAULT_SET).await?;
//! println!("scene written to {:?}", model.glb_path);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod config;
pub mod context;
pub mod decimate;
pub mod enums;
pub mod error;
pub mod filters;
pub mod glb;
mod interpolator;
pub mod isosurface;
pub mod jobs;
pub mod mesh;
pub mod mesh_builder;
pub mod morphology;
pub mod overlay;
pub mod quadric;
pub mod scene;
pub mod segmentation;
pub mod smoothing;
pub mod statistics;
pub mod store;
pub mod volume;
pub mod volume_assembler;
pub mod volume_loader;

pub use config::Settings;
pub use context::PipelineContext;
pub use enums::{SortBy, TissueKind, TissueLabel};
pub use error::{Error, Result};
pub use volume_loader::{DicomLibrary, InMemorySource, SeriesSource};
