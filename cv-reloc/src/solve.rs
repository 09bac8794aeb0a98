//! Lifting 2D matches to 2D-3D correspondences and solving one pose per group of images.

use cv_core::nalgebra::{Point2, Point3};
use log::*;
use std::collections::HashSet;

use crate::{
    Camera, ImageId, LocalFeatures, MatchedCandidates, PointId, PoseEstimate, PoseSolver,
    PoseSolverOptions, Reconstruction,
};

/// A solve needs at least this many correspondences.
pub const MIN_CORRESPONDENCES: usize = 4;

/// 2D-3D correspondences of one query, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lifted {
    /// Query keypoints in COLMAP pixel coordinates.
    pub points2d: Vec<Point2<f64>>,
    pub points3d: Vec<Point3<f64>>,
    pub point_ids: Vec<PointId>,
}

impl Lifted {
    pub fn len(&self) -> usize {
        self.points2d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points2d.is_empty()
    }
}

/// Combines the matches of `members` with the landmarks their keypoints observe.
///
/// A query keypoint linked to several landmarks is kept once per landmark.
pub fn lift_correspondences(
    reconstruction: &Reconstruction,
    query: &LocalFeatures,
    members: &[ImageId],
    matched: &MatchedCandidates,
) -> Lifted {
    let mut seen: HashSet<(usize, PointId)> = HashSet::new();
    let mut lifted = Lifted::default();
    for &member in members {
        let image = match reconstruction.image(member) {
            Some(image) => image,
            None => continue,
        };
        for correspondence in matched.get(member) {
            let point_id = match image.point_id(correspondence.candidate) {
                Some(point_id) => point_id,
                None => continue,
            };
            let point = match reconstruction.point(point_id) {
                Some(point) => point,
                None => continue,
            };
            if correspondence.query >= query.len()
                || !seen.insert((correspondence.query, point_id))
            {
                continue;
            }
            lifted.points2d.push(query.colmap_keypoint(correspondence.query));
            lifted.points3d.push(point.position);
            lifted.point_ids.push(point_id);
        }
    }
    lifted
}

/// The outcome of one solve attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    /// Fewer than [`MIN_CORRESPONDENCES`] correspondences.
    Insufficient { correspondences: usize },
    /// The solver found no pose or failed.
    NoSolution { correspondences: usize },
    Solved(PoseHypothesis),
}

/// A pose proposed by one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseHypothesis {
    pub estimate: PoseEstimate,
    /// The images whose correspondences were pooled.
    pub images: Vec<ImageId>,
    pub correspondences: usize,
}

impl PoseHypothesis {
    pub fn num_inliers(&self) -> usize {
        self.estimate.num_inliers
    }
}

pub fn solve_group(
    solver: &dyn PoseSolver,
    camera: &Camera,
    options: &PoseSolverOptions,
    images: &[ImageId],
    lifted: &Lifted,
) -> Attempt {
    let correspondences = lifted.len();
    if correspondences < MIN_CORRESPONDENCES {
        debug!(
            "skipping {:?} with {} correspondences",
            images, correspondences
        );
        return Attempt::Insufficient { correspondences };
    }
    match solver.estimate_pose(&lifted.points2d, &lifted.points3d, camera, options) {
        Ok(Some(estimate)) => {
            debug!(
                "{:?}: {} of {} correspondences are inliers",
                images, estimate.num_inliers, correspondences
            );
            Attempt::Solved(PoseHypothesis {
                estimate,
                images: images.to_vec(),
                correspondences,
            })
        }
        Ok(None) => Attempt::NoSolution { correspondences },
        Err(e) => {
            warn!("pose solver failed on {:?}: {}", images, e);
            Attempt::NoSolution { correspondences }
        }
    }
}
