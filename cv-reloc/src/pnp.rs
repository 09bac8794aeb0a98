//! The built-in pose solver: ARRSAC over Lambda Twist P3P, then Levenberg-Marquardt refinement.

use arrsac::Arrsac;
use cv_core::nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, IsometryMatrix3, Point2, Point3, Rotation3, Translation3, VecStorage,
    Vector3,
};
use cv_core::sample_consensus::Consensus;
use cv_core::{FeatureWorldMatch, WorldPoint, WorldToCamera};
use lambda_twist::LambdaTwist;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::*;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::{Camera, CapabilityError, PoseEstimate, PoseSolver, PoseSolverOptions};

/// Intrinsics are only refined when there are at least this many residuals per parameter.
const RESIDUALS_PER_PARAMETER: usize = 4;
/// Residual assigned to each axis of a point behind the camera.
const BEHIND_CAMERA_PENALTY: f64 = 1e3;

#[derive(Debug, Clone)]
pub struct ArrsacPnpSolver {
    seed: u64,
    patience: usize,
    lambda_twist: LambdaTwist,
}

impl ArrsacPnpSolver {
    pub fn new(seed: u64, patience: usize) -> Self {
        Self {
            seed,
            patience,
            lambda_twist: LambdaTwist::new(),
        }
    }
}

/// Indices of correspondences reprojecting within `max_error` pixels in front of the camera.
pub fn pixel_inliers(
    pose: &WorldToCamera,
    camera: &Camera,
    points2d: &[Point2<f64>],
    points3d: &[Point3<f64>],
    max_error: f64,
) -> Vec<usize> {
    points2d
        .iter()
        .zip(points3d)
        .enumerate()
        .filter_map(|(ix, (observed, world))| {
            let projected = camera.project(&(pose.0 * world))?;
            ((projected - observed).norm() <= max_error).then(|| ix)
        })
        .collect()
}

impl PoseSolver for ArrsacPnpSolver {
    fn estimate_pose(
        &self,
        points2d: &[Point2<f64>],
        points3d: &[Point3<f64>],
        camera: &Camera,
        options: &PoseSolverOptions,
    ) -> Result<Option<PoseEstimate>, CapabilityError> {
        if points2d.len() != points3d.len() {
            return Err(CapabilityError::Estimation(format!(
                "{} image points but {} world points",
                points2d.len(),
                points3d.len()
            )));
        }
        if points2d.len() < 4 {
            return Ok(None);
        }

        let matches: Vec<FeatureWorldMatch> = points2d
            .iter()
            .zip(points3d)
            .map(|(pixel, world)| {
                FeatureWorldMatch(camera.bearing(*pixel), WorldPoint(world.to_homogeneous()))
            })
            .collect();
        // The consensus works on bearings, so the pixel threshold becomes an angle.
        let angle = (options.max_error / camera.mean_focal()).atan();
        let threshold = 1.0 - angle.cos();
        let mut arrsac = Arrsac::new(threshold, Pcg64::seed_from_u64(self.seed));
        let (pose, consensus_inliers) =
            match arrsac.model_inliers(&self.lambda_twist, matches.iter().cloned()) {
                Some(found) => found,
                None => {
                    debug!("consensus found no pose among {} matches", matches.len());
                    return Ok(None);
                }
            };

        let inliers = pixel_inliers(&pose, camera, points2d, points3d, options.max_error);
        debug!(
            "consensus kept {} bearings, {} within {} px",
            consensus_inliers.len(),
            inliers.len(),
            options.max_error
        );
        if inliers.len() < 4 {
            return Ok(None);
        }

        let mut intrinsics =
            camera.refinable_indices(options.refine_focal_length, options.refine_extra_params);
        if 2 * inliers.len() < RESIDUALS_PER_PARAMETER * (6 + intrinsics.len()) {
            intrinsics.clear();
        }
        let problem = PoseRefinement::new(
            pose,
            camera.clone(),
            intrinsics,
            inliers.iter().map(|&ix| points2d[ix]).collect(),
            inliers.iter().map(|&ix| points3d[ix]).collect(),
        );
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .minimize(problem);
        debug!(
            "refinement finished after {} evaluations with {:?}",
            report.number_of_evaluations, report.termination
        );

        let unrefined = PoseEstimate {
            pose,
            num_inliers: inliers.len(),
            camera: camera.clone(),
        };
        let (refined_pose, refined_camera) = match problem.model() {
            Some(model) => model,
            None => return Ok(Some(unrefined)),
        };
        let refined_inliers = pixel_inliers(
            &refined_pose,
            &refined_camera,
            points2d,
            points3d,
            options.max_error,
        );
        if refined_inliers.len() < inliers.len() {
            debug!("refinement lost inliers, keeping the consensus pose");
            return Ok(Some(unrefined));
        }
        Ok(Some(PoseEstimate {
            pose: refined_pose,
            num_inliers: refined_inliers.len(),
            camera: refined_camera,
        }))
    }
}

/// Reprojection error minimization over the pose and selected intrinsics.
///
/// Parameters are the scaled rotation axis, the translation, then the intrinsics.
struct PoseRefinement {
    params: DVector<f64>,
    camera: Camera,
    intrinsics: Vec<usize>,
    points2d: Vec<Point2<f64>>,
    points3d: Vec<Point3<f64>>,
}

impl PoseRefinement {
    fn new(
        pose: WorldToCamera,
        camera: Camera,
        intrinsics: Vec<usize>,
        points2d: Vec<Point2<f64>>,
        points3d: Vec<Point3<f64>>,
    ) -> Self {
        let rotation = pose.0.rotation.scaled_axis();
        let translation = pose.0.translation.vector;
        let params = DVector::from_iterator(
            6 + intrinsics.len(),
            rotation
                .iter()
                .chain(translation.iter())
                .copied()
                .chain(intrinsics.iter().map(|&ix| camera.params()[ix])),
        );
        Self {
            params,
            camera,
            intrinsics,
            points2d,
            points3d,
        }
    }

    fn model_at(&self, params: &DVector<f64>) -> Option<(WorldToCamera, Camera)> {
        let rotation = Rotation3::from_scaled_axis(Vector3::new(params[0], params[1], params[2]));
        let translation = Translation3::new(params[3], params[4], params[5]);
        let mut camera_params = self.camera.params().to_vec();
        for (slot, &ix) in self.intrinsics.iter().enumerate() {
            camera_params[ix] = params[6 + slot];
        }
        let camera = self.camera.with_params(camera_params).ok()?;
        Some((
            WorldToCamera(IsometryMatrix3::from_parts(translation, rotation)),
            camera,
        ))
    }

    fn model(&self) -> Option<(WorldToCamera, Camera)> {
        if self.params.iter().all(|p| p.is_finite()) {
            self.model_at(&self.params)
        } else {
            None
        }
    }

    fn residuals_at(&self, params: &DVector<f64>) -> Option<DVector<f64>> {
        let (pose, camera) = self.model_at(params)?;
        let mut residuals = DVector::zeros(2 * self.points2d.len());
        for (ix, (observed, world)) in self.points2d.iter().zip(&self.points3d).enumerate() {
            let error = match camera.project(&(pose.0 * world)) {
                Some(projected) => projected - observed,
                None => cv_core::nalgebra::Vector2::repeat(BEHIND_CAMERA_PENALTY),
            };
            residuals[2 * ix] = error.x;
            residuals[2 * ix + 1] = error.y;
        }
        Some(residuals)
    }
}

impl LeastSquaresProblem<f64, Dynamic, Dynamic> for PoseRefinement {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.residuals_at(&self.params)
    }

    /// Central differences.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let rows = 2 * self.points2d.len();
        let mut jacobian = DMatrix::zeros(rows, self.params.len());
        let mut shifted = self.params.clone();
        for col in 0..self.params.len() {
            let value = self.params[col];
            let step = 1e-6 * value.abs().max(1.0);
            shifted[col] = value + step;
            let forward = self.residuals_at(&shifted)?;
            shifted[col] = value - step;
            let backward = self.residuals_at(&shifted)?;
            shifted[col] = value;
            jacobian.set_column(col, &((forward - backward) / (2.0 * step)));
        }
        Some(jacobian)
    }
}
