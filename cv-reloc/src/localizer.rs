//! The query pipeline: preprocess, extract, retrieve, match, cluster, solve, select, transform.

use cv_core::WorldToCamera;
use image::{DynamicImage, GenericImageView};
use log::*;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::{
    covisibility_clusters, lift_correspondences, match_candidates, retrieve, select_hypothesis,
    solve_group, to_geopose, Attempt, Camera, CameraError, Capabilities, CapabilityError, GeoPose,
    ImageId, LocalizerSettings, Map, MapCalibration, PoseSolverOptions, Rejection,
};

/// The steps of a query, in the order they run.
///
/// There is no failed state. A query that stops early returns a
/// [`LocalizationFailure`] whose `stage` is the step that gave up, and a
/// query that succeeds has passed through [`Stage::Done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Idle,
    PreprocessQuery,
    ExtractLocal,
    ExtractGlobal,
    Retrieve,
    Match,
    Cluster,
    Solve,
    SelectHypothesis,
    Transform,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum FailureKind {
    #[error("the query image is empty")]
    BadImage,
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("feature extraction failed: {0}")]
    Extraction(CapabilityError),
    #[error("retrieval failed: {0}")]
    Retrieval(CapabilityError),
    #[error("the map returned no candidate images")]
    NoCandidates,
    #[error("matching failed for all {attempted} candidates")]
    AllCandidatesFailed { attempted: usize },
    #[error("none of {attempted} pose attempts produced a pose")]
    NoViableClusters { attempted: usize },
    #[error("best pose has {inliers} inliers, {required} are required")]
    PoseRejected { inliers: usize, required: usize },
    #[error("the map has no calibration to the globe")]
    CalibrationMissing,
}

/// The "no pose" answer to a query.
#[derive(Debug, Error)]
#[error("no pose ({stage}): {kind}")]
pub struct LocalizationFailure {
    pub stage: Stage,
    pub kind: FailureKind,
}

impl LocalizationFailure {
    pub fn is_calibration_missing(&self) -> bool {
        matches!(self.kind, FailureKind::CalibrationMissing)
    }
}

/// A query image and the intrinsics of the camera that took it.
#[derive(Debug, Clone)]
pub struct Query {
    pub image: DynamicImage,
    /// A COLMAP model name such as `SIMPLE_RADIAL`.
    pub camera_model: String,
    pub params: Vec<f64>,
}

/// A successful localization.
#[derive(Debug, Clone, PartialEq)]
pub struct Localization {
    pub geopose: GeoPose,
    pub pose: WorldToCamera,
    pub camera: Camera,
    pub num_inliers: usize,
    /// The images whose correspondences produced the pose.
    pub images: Vec<ImageId>,
    /// The pose is the stored pose of the nearest candidate, not a solve.
    pub degraded: bool,
}

pub trait Localize: Send + Sync {
    fn localize(&self, query: &Query) -> Result<Localization, LocalizationFailure>;
}

/// Tracks the current stage so failures are reported where they happen.
struct Pipeline {
    stage: Stage,
}

impl Pipeline {
    fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    fn enter(&mut self, stage: Stage) {
        debug_assert!(stage > self.stage, "stages only move forward");
        trace!("{} -> {}", self.stage, stage);
        self.stage = stage;
    }

    fn fail(&self, kind: impl Into<FailureKind>) -> LocalizationFailure {
        let failure = LocalizationFailure {
            stage: self.stage,
            kind: kind.into(),
        };
        info!("{}", failure);
        failure
    }
}

/// Localizes queries against one map.
pub struct Localizer {
    map: Arc<Map>,
    calibration: RwLock<Option<Arc<MapCalibration>>>,
    capabilities: Capabilities,
    settings: LocalizerSettings,
}

impl Localizer {
    pub fn new(
        map: Arc<Map>,
        calibration: Option<MapCalibration>,
        capabilities: Capabilities,
        settings: LocalizerSettings,
    ) -> Self {
        Self {
            map,
            calibration: RwLock::new(calibration.map(Arc::new)),
            capabilities,
            settings,
        }
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    pub fn settings(&self) -> &LocalizerSettings {
        &self.settings
    }

    /// A snapshot of the calibration; later replacements do not affect it.
    pub fn calibration(&self) -> Option<Arc<MapCalibration>> {
        self.calibration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_calibration(&self, calibration: Option<MapCalibration>) {
        *self
            .calibration
            .write()
            .unwrap_or_else(PoisonError::into_inner) = calibration.map(Arc::new);
    }

    fn solver_options(&self) -> PoseSolverOptions {
        PoseSolverOptions {
            max_error: self.settings.ransac_max_error,
            refine_focal_length: self.settings.refine_focal_length,
            refine_extra_params: self.settings.refine_extra_params,
        }
    }
}

impl Localize for Localizer {
    fn localize(&self, query: &Query) -> Result<Localization, LocalizationFailure> {
        let mut pipeline = Pipeline::new();
        let reconstruction = self.map.reconstruction();

        pipeline.enter(Stage::PreprocessQuery);
        let (width, height) = query.image.dimensions();
        if width == 0 || height == 0 {
            return Err(pipeline.fail(FailureKind::BadImage));
        }
        let camera = Camera::from_name(&query.camera_model, width, height, query.params.clone())
            .map_err(|e| pipeline.fail(e))?;
        let (prepared, scale) = self.capabilities.extractor.preprocessing().apply(&query.image);

        pipeline.enter(Stage::ExtractLocal);
        let mut features = self
            .capabilities
            .extractor
            .extract_local(&prepared)
            .map_err(|e| pipeline.fail(FailureKind::Extraction(e)))?;
        features.rescale(scale);
        info!("extracted {} query keypoints", features.len());

        let global = match &self.capabilities.global {
            Some(extractor) => {
                pipeline.enter(Stage::ExtractGlobal);
                let (prepared, _) = extractor.preprocessing().apply(&query.image);
                let descriptor = extractor
                    .extract_global(&prepared)
                    .map_err(|e| pipeline.fail(FailureKind::Extraction(e)))?;
                Some(descriptor)
            }
            None => None,
        };

        pipeline.enter(Stage::Retrieve);
        let candidates = retrieve(&self.map, global.as_deref(), self.settings.retrieval_top_k)
            .map_err(|e| pipeline.fail(FailureKind::Retrieval(e)))?;
        if candidates.images.is_empty() {
            return Err(pipeline.fail(FailureKind::NoCandidates));
        }
        info!(
            "{} candidates ({})",
            candidates.images.len(),
            if candidates.ranked { "ranked" } else { "unranked" }
        );

        pipeline.enter(Stage::Match);
        let matched = match_candidates(
            self.capabilities.matcher.as_ref(),
            &features,
            &self.map,
            &candidates.images,
        )
        .ok_or_else(|| {
            pipeline.fail(FailureKind::AllCandidatesFailed {
                attempted: candidates.images.len(),
            })
        })?;

        let groups = if self.settings.covisibility_clustering {
            pipeline.enter(Stage::Cluster);
            let clusters = covisibility_clusters(reconstruction, &matched.order);
            info!("{} covisibility clusters", clusters.len());
            clusters
        } else {
            vec![matched.order.clone()]
        };

        pipeline.enter(Stage::Solve);
        let options = self.solver_options();
        let attempts: Vec<Attempt> = groups
            .iter()
            .map(|group| {
                let lifted = lift_correspondences(reconstruction, &features, group, &matched);
                solve_group(
                    self.capabilities.solver.as_ref(),
                    &camera,
                    &options,
                    group,
                    &lifted,
                )
            })
            .collect();

        pipeline.enter(Stage::SelectHypothesis);
        let selected = match select_hypothesis(&attempts, self.settings.minimum_inliers) {
            Ok(hypothesis) => Some(hypothesis),
            Err(rejection)
                if !self.settings.covisibility_clustering
                    && self.settings.fallback_to_nearest_candidate =>
            {
                warn!("{:?}, falling back to the nearest candidate pose", rejection);
                None
            }
            Err(Rejection::NoHypothesis) => {
                return Err(pipeline.fail(FailureKind::NoViableClusters {
                    attempted: attempts.len(),
                }))
            }
            Err(Rejection::TooFewInliers { inliers, required }) => {
                return Err(pipeline.fail(FailureKind::PoseRejected { inliers, required }))
            }
        };
        let (pose, camera, num_inliers, images, degraded) = match selected {
            Some(hypothesis) => (
                hypothesis.estimate.pose,
                hypothesis.estimate.camera.clone(),
                hypothesis.num_inliers(),
                hypothesis.images.clone(),
                false,
            ),
            None => {
                let nearest = matched
                    .order
                    .first()
                    .and_then(|&id| reconstruction.image(id))
                    .ok_or_else(|| {
                        pipeline.fail(FailureKind::NoViableClusters {
                            attempted: attempts.len(),
                        })
                    })?;
                (nearest.pose, camera, 0, vec![nearest.id], true)
            }
        };

        pipeline.enter(Stage::Transform);
        let calibration = self
            .calibration()
            .ok_or_else(|| pipeline.fail(FailureKind::CalibrationMissing))?;
        let geopose = to_geopose(&pose, &calibration);

        pipeline.enter(Stage::Done);
        info!(
            "localized with {} inliers from {:?} at lat {} lon {} h {}",
            num_inliers, images, geopose.position.lat, geopose.position.lon, geopose.position.h
        );
        Ok(Localization {
            geopose,
            pose,
            camera,
            num_inliers,
            images,
            degraded,
        })
    }
}
