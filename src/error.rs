use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("No body voxels passed the body threshold")]
    EmptyBody,

    #[error("Volume has no intensity variation")]
    NoIntensityVariation,

    #[error("No valid geometry: {0}")]
    NoGeometry(String),

    #[error("No meshes could be generated. Failed tissues: {}", .0.join(", "))]
    NoUsableMeshes(Vec<String>),

    #[error("Model generation already in progress for series {0}")]
    GenerationAlreadyInProgress(String),

    #[error("Model for series {0} was invalidated by a newer analysis")]
    StaleModel(String),

    #[error("Unknown tissue: {0}")]
    UnknownTissue(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Worker(err.to_string())
    }
}
