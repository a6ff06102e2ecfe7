use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the reconstruction, rigging and cleanup stages.
#[derive(Error, Debug)]
pub enum FacemeshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported image encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("no face detected")]
    NoFaceDetected,

    #[error("expected {expected} landmarks, found {found}")]
    LandmarkCount { expected: usize, found: usize },

    #[error("OBJ format error at line {line}: {message}")]
    ObjFormat { line: usize, message: String },

    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("environment not ready: {0}")]
    EnvironmentNotReady(String),

    #[error("degenerate face basis: {0} has zero length")]
    DegenerateBasis(&'static str),

    #[error("vertex index {index} out of range for mesh with {len} vertices")]
    VertexIndexOutOfRange { index: usize, len: usize },

    #[error("transform of '{0}' is not invertible")]
    NonInvertibleTransform(String),

    #[error("unknown face region '{0}'")]
    UnknownRegion(String),

    #[error("could not write capture array: {0}")]
    NpyExport(#[from] ndarray_npy::WriteNpyError),

    #[error("landmark model error: {0}")]
    Model(String),

    #[error("could not format output: {0}")]
    Format(#[from] std::fmt::Error),

    #[error("asset not found: {0:?}")]
    AssetNotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, FacemeshError>;
