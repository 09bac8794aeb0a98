use cv_core::nalgebra::Matrix4;
use log::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::geodesy::GeodeticPosition;
use crate::MapError;

/// Converts the y-up graphics frame of `transform.json` into the z-up robotics frame.
#[rustfmt::skip]
pub fn graphics_to_robotics() -> Matrix4<f64> {
    Matrix4::new(
        1.0, 0.0,  0.0, 0.0,
        0.0, 0.0, -1.0, 0.0,
        0.0, 1.0,  0.0, 0.0,
        0.0, 0.0,  0.0, 1.0,
    )
}

/// The anchoring of a map on the globe.
#[derive(Debug, Clone, PartialEq)]
pub struct MapCalibration {
    /// Homogeneous transform from map coordinates to the local ENU frame at `reference`.
    pub map_to_enu: Matrix4<f64>,
    pub reference: GeodeticPosition,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransformFile {
    pub latitude: f64,
    pub longitude: f64,
    pub height: f64,
    /// Row-major map to ENU transform, in the graphics convention.
    pub matrix: [[f64; 4]; 4],
}

impl MapCalibration {
    pub fn new(map_to_enu: Matrix4<f64>, reference: GeodeticPosition) -> Result<Self, MapError> {
        if !reference.is_valid() {
            return Err(MapError::Calibration(format!(
                "reference position {:?} is out of range",
                reference
            )));
        }
        if map_to_enu.iter().any(|v| !v.is_finite()) {
            return Err(MapError::Calibration("transform is not finite".into()));
        }
        let last_row = [0, 1, 2, 3].map(|c| map_to_enu[(3, c)]);
        if last_row != [0.0, 0.0, 0.0, 1.0] {
            return Err(MapError::Calibration("transform is not affine".into()));
        }
        Ok(Self {
            map_to_enu,
            reference,
        })
    }

    /// The map frame is already the ENU frame at `reference`.
    pub fn identity_at(reference: GeodeticPosition) -> Result<Self, MapError> {
        Self::new(Matrix4::identity(), reference)
    }

    pub fn from_transform(file: &TransformFile) -> Result<Self, MapError> {
        let matrix = Matrix4::from_fn(|r, c| file.matrix[r][c]);
        Self::new(
            graphics_to_robotics() * matrix,
            GeodeticPosition::new(file.latitude, file.longitude, file.height),
        )
    }

    /// Reads a `transform.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| MapError::io(path, e))?;
        let file: TransformFile = serde_json::from_str(&text)
            .map_err(|e| MapError::Calibration(format!("{}: {}", path.display(), e)))?;
        let calibration = Self::from_transform(&file)?;
        info!(
            "map anchored at lat {} lon {} height {}",
            file.latitude, file.longitude, file.height
        );
        Ok(calibration)
    }
}
