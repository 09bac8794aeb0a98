//! Intrinsic camera models using the parameter layouts of COLMAP.
//!
//! A [`Camera`] converts between pixel coordinates and normalized image
//! coordinates. `calibrate` removes the intrinsics and lens distortion from a
//! pixel, `uncalibrate` applies them.

use cv_core::nalgebra::{Point2, Point3, Unit, UnitVector3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const UNDISTORT_ITERATIONS: usize = 100;
const UNDISTORT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CameraError {
    #[error("unknown camera model {0:?}")]
    UnknownModel(String),
    #[error("camera model {model} takes {expected} parameters, got {actual}")]
    ParameterCount {
        model: CameraModel,
        expected: usize,
        actual: usize,
    },
    #[error("camera parameter {index} is not finite")]
    NonFiniteParameter { index: usize },
    #[error("focal length must be positive")]
    NonPositiveFocal,
    #[error("camera dimensions {width}x{height} are invalid")]
    InvalidDimensions { width: u32, height: u32 },
}

/// The supported intrinsic models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraModel {
    /// `f, cx, cy`
    SimplePinhole,
    /// `fx, fy, cx, cy`
    Pinhole,
    /// `f, cx, cy, k`
    SimpleRadial,
    /// `f, cx, cy, k1, k2`
    Radial,
    /// `fx, fy, cx, cy, k1, k2, p1, p2`
    OpenCv,
}

impl CameraModel {
    pub fn from_name(name: &str) -> Result<Self, CameraError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SIMPLE_PINHOLE" => Ok(Self::SimplePinhole),
            "PINHOLE" => Ok(Self::Pinhole),
            "SIMPLE_RADIAL" => Ok(Self::SimpleRadial),
            "RADIAL" => Ok(Self::Radial),
            "OPENCV" => Ok(Self::OpenCv),
            _ => Err(CameraError::UnknownModel(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SimplePinhole => "SIMPLE_PINHOLE",
            Self::Pinhole => "PINHOLE",
            Self::SimpleRadial => "SIMPLE_RADIAL",
            Self::Radial => "RADIAL",
            Self::OpenCv => "OPENCV",
        }
    }

    pub fn num_params(self) -> usize {
        match self {
            Self::SimplePinhole => 3,
            Self::Pinhole | Self::SimpleRadial => 4,
            Self::Radial => 5,
            Self::OpenCv => 8,
        }
    }

    /// Indices of the focal length parameters.
    pub fn focal_indices(self) -> &'static [usize] {
        match self {
            Self::SimplePinhole | Self::SimpleRadial | Self::Radial => &[0],
            Self::Pinhole | Self::OpenCv => &[0, 1],
        }
    }

    fn principal_indices(self) -> [usize; 2] {
        match self {
            Self::SimplePinhole | Self::SimpleRadial | Self::Radial => [1, 2],
            Self::Pinhole | Self::OpenCv => [2, 3],
        }
    }

    /// Indices of the distortion parameters.
    pub fn extra_indices(self) -> &'static [usize] {
        match self {
            Self::SimplePinhole | Self::Pinhole => &[],
            Self::SimpleRadial => &[3],
            Self::Radial => &[3, 4],
            Self::OpenCv => &[4, 5, 6, 7],
        }
    }
}

impl fmt::Display for CameraModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A calibrated camera: a model, the image size and the model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub model: CameraModel,
    pub width: u32,
    pub height: u32,
    params: Vec<f64>,
}

impl Camera {
    pub fn new(
        model: CameraModel,
        width: u32,
        height: u32,
        params: Vec<f64>,
    ) -> Result<Self, CameraError> {
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidDimensions { width, height });
        }
        if params.len() != model.num_params() {
            return Err(CameraError::ParameterCount {
                model,
                expected: model.num_params(),
                actual: params.len(),
            });
        }
        if let Some(index) = params.iter().position(|p| !p.is_finite()) {
            return Err(CameraError::NonFiniteParameter { index });
        }
        if model.focal_indices().iter().any(|&ix| params[ix] <= 0.0) {
            return Err(CameraError::NonPositiveFocal);
        }
        Ok(Self {
            model,
            width,
            height,
            params,
        })
    }

    pub fn from_name(
        model: &str,
        width: u32,
        height: u32,
        params: Vec<f64>,
    ) -> Result<Self, CameraError> {
        Self::new(CameraModel::from_name(model)?, width, height, params)
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Replaces the parameters, keeping the model and size.
    pub fn with_params(&self, params: Vec<f64>) -> Result<Self, CameraError> {
        Self::new(self.model, self.width, self.height, params)
    }

    pub fn focals(&self) -> Vector2<f64> {
        match self.model.focal_indices() {
            [f] => Vector2::new(self.params[*f], self.params[*f]),
            [fx, fy] => Vector2::new(self.params[*fx], self.params[*fy]),
            _ => unreachable!("every model has one or two focal lengths"),
        }
    }

    pub fn mean_focal(&self) -> f64 {
        let f = self.focals();
        0.5 * (f.x + f.y)
    }

    pub fn principal_point(&self) -> Point2<f64> {
        let [cx, cy] = self.model.principal_indices();
        Point2::new(self.params[cx], self.params[cy])
    }

    /// Indices of the parameters a refinement may adjust.
    pub fn refinable_indices(&self, focal: bool, extra: bool) -> Vec<usize> {
        let mut indices = vec![];
        if focal {
            indices.extend_from_slice(self.model.focal_indices());
        }
        if extra {
            indices.extend_from_slice(self.model.extra_indices());
        }
        indices
    }

    /// Offset applied by the lens distortion to an undistorted normalized point.
    fn distortion(&self, u: Vector2<f64>) -> Vector2<f64> {
        let p = &self.params;
        let r2 = u.norm_squared();
        match self.model {
            CameraModel::SimplePinhole | CameraModel::Pinhole => Vector2::zeros(),
            CameraModel::SimpleRadial => u * (p[3] * r2),
            CameraModel::Radial => u * (p[3] * r2 + p[4] * r2 * r2),
            CameraModel::OpenCv => {
                let (k1, k2, p1, p2) = (p[4], p[5], p[6], p[7]);
                let radial = k1 * r2 + k2 * r2 * r2;
                let uv = u.x * u.y;
                Vector2::new(
                    u.x * radial + 2.0 * p1 * uv + p2 * (r2 + 2.0 * u.x * u.x),
                    u.y * radial + 2.0 * p2 * uv + p1 * (r2 + 2.0 * u.y * u.y),
                )
            }
        }
    }

    /// Converts a pixel into undistorted normalized image coordinates.
    pub fn calibrate(&self, pixel: Point2<f64>) -> Point2<f64> {
        let f = self.focals();
        let c = self.principal_point();
        let distorted = Vector2::new((pixel.x - c.x) / f.x, (pixel.y - c.y) / f.y);
        if self.model.extra_indices().is_empty() {
            return Point2::from(distorted);
        }
        let mut undistorted = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let next = distorted - self.distortion(undistorted);
            let step = (next - undistorted).norm_squared();
            undistorted = next;
            if step < UNDISTORT_EPSILON * UNDISTORT_EPSILON {
                break;
            }
        }
        Point2::from(undistorted)
    }

    /// Converts undistorted normalized image coordinates into a pixel.
    pub fn uncalibrate(&self, normalized: Point2<f64>) -> Point2<f64> {
        let f = self.focals();
        let c = self.principal_point();
        let distorted = normalized.coords + self.distortion(normalized.coords);
        Point2::new(f.x * distorted.x + c.x, f.y * distorted.y + c.y)
    }

    /// The unit ray leaving the camera through the pixel.
    pub fn bearing(&self, pixel: Point2<f64>) -> UnitVector3<f64> {
        let n = self.calibrate(pixel);
        Unit::new_normalize(Vector3::new(n.x, n.y, 1.0))
    }

    /// Projects a point in camera coordinates to a pixel, if it is in front of the camera.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        Some(self.uncalibrate(Point2::new(point.x / point.z, point.y / point.z)))
    }
}
