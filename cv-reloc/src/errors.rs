use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::camera::CameraError;

/// Failures while reading a map directory from disk.
///
/// Everything except [`MapError::MissingDescriptor`] aborts a load. A missing
/// descriptor is only raised when a single image is looked up and is recovered
/// from by dropping that image from the query.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("required map file {path} does not exist")]
    MissingFile { path: PathBuf },
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("corrupt container {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("inconsistent reconstruction: {0}")]
    Inconsistent(String),
    #[error("the reconstruction has no registered images")]
    NoImages,
    #[error("image {0} has no local descriptors in the map")]
    MissingDescriptor(String),
    #[error("invalid map calibration: {0}")]
    Calibration(String),
    #[error("invalid map config {path}: {message}")]
    Config { path: PathBuf, message: String },
    #[error(transparent)]
    Camera(#[from] CameraError),
}

impl MapError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::MissingFile { path }
        } else {
            Self::Io { path, source }
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Failures reported by a pluggable extractor, matcher or solver.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("feature extraction failed: {0}")]
    Extraction(String),
    #[error("matching failed: {0}")]
    Matching(String),
    #[error("pose estimation failed: {0}")]
    Estimation(String),
    #[error("descriptor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no map with id {0:?} is loaded")]
    UnknownMap(String),
    #[error("no map is currently selected")]
    NoCurrentMap,
    #[error("no {kind} is registered under the key {key:?}")]
    UnknownCapability { kind: &'static str, key: String },
    #[error("map {id:?} is already loaded from {}", loaded.display())]
    AlreadyLoaded { id: String, loaded: PathBuf },
    #[error("map {id:?} is a fixed map and has no calibration")]
    NotReloadable { id: String },
    #[error("failed to load map {id:?}: {source}")]
    Load {
        id: String,
        #[source]
        source: MapError,
    },
}
