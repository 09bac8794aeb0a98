//! From a camera pose in map coordinates to a geodetic pose.
//!
//! Poses coming out of the solver follow the vision convention (X right,
//! Y down, Z forward). The reported orientation uses robotics axes (X forward,
//! Y left, Z up) expressed in the local ENU frame.

use cv_core::nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use cv_core::WorldToCamera;
use serde::{Deserialize, Serialize};

use crate::geodesy::{enu_to_geodetic, GeodeticPosition};
use crate::MapCalibration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoQuaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl From<UnitQuaternion<f64>> for GeoQuaternion {
    fn from(q: UnitQuaternion<f64>) -> Self {
        let coords = q.into_inner().coords;
        Self {
            x: coords[0],
            y: coords[1],
            z: coords[2],
            w: coords[3],
        }
    }
}

/// A position on the WGS84 ellipsoid and an orientation in the local ENU frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPose {
    pub position: GeodeticPosition,
    pub quaternion: GeoQuaternion,
}

impl GeoPose {
    /// A pose facing the identity orientation.
    pub fn at(position: GeodeticPosition) -> Self {
        Self {
            position,
            quaternion: UnitQuaternion::identity().into(),
        }
    }
}

/// Maps vision camera axes onto robotics body axes.
#[rustfmt::skip]
pub fn vision_to_robotics() -> Rotation3<f64> {
    Rotation3::from_matrix_unchecked(Matrix3::new(
        0.0, -1.0,  0.0,
        0.0,  0.0, -1.0,
        1.0,  0.0,  0.0,
    ))
}

/// The camera position and its vision-frame orientation in ENU.
pub fn camera_in_enu(pose: &WorldToCamera, calibration: &MapCalibration) -> (Vector3<f64>, Rotation3<f64>) {
    let camera_to_map = pose.0.inverse().to_homogeneous();
    let camera_to_enu = calibration.map_to_enu * camera_to_map;
    let position = Vector3::new(camera_to_enu[(0, 3)], camera_to_enu[(1, 3)], camera_to_enu[(2, 3)]);
    let linear = Matrix3::from_fn(|r, c| camera_to_enu[(r, c)]);
    // Calibrations may carry a scale, which is removed here.
    let rotation = Rotation3::from_matrix(&linear);
    (position, rotation)
}

/// Converts a camera-from-world pose into a [`GeoPose`].
pub fn to_geopose(pose: &WorldToCamera, calibration: &MapCalibration) -> GeoPose {
    let (position, rotation) = camera_in_enu(pose, calibration);
    let orientation = rotation * vision_to_robotics();
    GeoPose {
        position: enu_to_geodetic(&position, &calibration.reference),
        quaternion: UnitQuaternion::from_rotation_matrix(&orientation).into(),
    }
}
