//! The pluggable stages of the pipeline and the registry resolving them by key.

use cv_core::nalgebra::{Point2, Point3};
use cv_core::WorldToCamera;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    AkazeExtractor, ArrsacPnpSolver, Camera, CapabilityError, LocalFeatures, LocalizerSettings,
    MapConfig, Matches, MutualNearestNeighbor, RegistryError, TinyImage,
};

/// How an extractor wants its input image prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Preprocessing {
    pub grayscale: bool,
    /// Downscale so the longer side is at most this many pixels.
    pub resize_max: Option<u32>,
}

impl Preprocessing {
    /// Returns the prepared image and the per-axis factor from prepared to original pixels.
    pub fn apply(&self, image: &DynamicImage) -> (DynamicImage, [f32; 2]) {
        let (width, height) = image.dimensions();
        let mut prepared = if self.grayscale {
            DynamicImage::ImageLuma8(image.to_luma8())
        } else {
            image.clone()
        };
        let mut scale = [1.0, 1.0];
        if let Some(max) = self.resize_max {
            let longest = width.max(height);
            if max > 0 && longest > max {
                let factor = max as f64 / longest as f64;
                let new_width = ((width as f64 * factor).round() as u32).max(1);
                let new_height = ((height as f64 * factor).round() as u32).max(1);
                prepared = prepared.resize_exact(new_width, new_height, FilterType::Triangle);
                scale = [
                    width as f32 / new_width as f32,
                    height as f32 / new_height as f32,
                ];
            }
        }
        (prepared, scale)
    }
}

pub trait FeatureExtractor: Send + Sync {
    fn preprocessing(&self) -> Preprocessing {
        Preprocessing::default()
    }

    /// Keypoints are returned in the coordinates of the image passed in.
    fn extract_local(&self, image: &DynamicImage) -> Result<LocalFeatures, CapabilityError>;
}

pub trait GlobalExtractor: Send + Sync {
    fn preprocessing(&self) -> Preprocessing {
        Preprocessing::default()
    }

    fn extract_global(&self, image: &DynamicImage) -> Result<Vec<f32>, CapabilityError>;
}

pub trait FeatureMatcher: Send + Sync {
    fn match_features(
        &self,
        query: &LocalFeatures,
        candidate: &LocalFeatures,
    ) -> Result<Matches, CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSolverOptions {
    /// Reprojection threshold in pixels.
    pub max_error: f64,
    pub refine_focal_length: bool,
    pub refine_extra_params: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoseEstimate {
    pub pose: WorldToCamera,
    pub num_inliers: usize,
    pub camera: Camera,
}

pub trait PoseSolver: Send + Sync {
    /// Returns `Ok(None)` when no pose explains the correspondences.
    fn estimate_pose(
        &self,
        points2d: &[Point2<f64>],
        points3d: &[Point3<f64>],
        camera: &Camera,
        options: &PoseSolverOptions,
    ) -> Result<Option<PoseEstimate>, CapabilityError>;
}

/// The implementations one map runs with.
#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Arc<dyn FeatureExtractor>,
    pub global: Option<Arc<dyn GlobalExtractor>>,
    pub matcher: Arc<dyn FeatureMatcher>,
    pub solver: Arc<dyn PoseSolver>,
}

type Constructor<T> = Box<dyn Fn(&LocalizerSettings) -> Arc<T> + Send + Sync>;

/// Maps configuration keys to capability constructors.
pub struct CapabilityRegistry {
    extractors: HashMap<String, Constructor<dyn FeatureExtractor>>,
    globals: HashMap<String, Constructor<dyn GlobalExtractor>>,
    matchers: HashMap<String, Constructor<dyn FeatureMatcher>>,
    solvers: HashMap<String, Constructor<dyn PoseSolver>>,
}

impl CapabilityRegistry {
    /// A registry without any capabilities.
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
            globals: HashMap::new(),
            matchers: HashMap::new(),
            solvers: HashMap::new(),
        }
    }

    /// A registry with the built-in capabilities.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_extractor("akaze", |s| {
            Arc::new(AkazeExtractor::new(s.akaze_threshold).with_resize_max(s.akaze_resize_max))
        });
        registry.register_global("tiny-image", |s| Arc::new(TinyImage::new(s.tiny_image_side)));
        registry.register_matcher("mutual-nn", |s| {
            Arc::new(MutualNearestNeighbor::new(s.matcher_ratio))
        });
        registry.register_solver("arrsac-lambda-twist", |s| {
            Arc::new(ArrsacPnpSolver::new(s.consensus_seed, s.refinement_patience))
        });
        registry
    }

    pub fn register_extractor(
        &mut self,
        key: impl Into<String>,
        constructor: impl Fn(&LocalizerSettings) -> Arc<dyn FeatureExtractor> + Send + Sync + 'static,
    ) {
        self.extractors.insert(key.into(), Box::new(constructor));
    }

    pub fn register_global(
        &mut self,
        key: impl Into<String>,
        constructor: impl Fn(&LocalizerSettings) -> Arc<dyn GlobalExtractor> + Send + Sync + 'static,
    ) {
        self.globals.insert(key.into(), Box::new(constructor));
    }

    pub fn register_matcher(
        &mut self,
        key: impl Into<String>,
        constructor: impl Fn(&LocalizerSettings) -> Arc<dyn FeatureMatcher> + Send + Sync + 'static,
    ) {
        self.matchers.insert(key.into(), Box::new(constructor));
    }

    pub fn register_solver(
        &mut self,
        key: impl Into<String>,
        constructor: impl Fn(&LocalizerSettings) -> Arc<dyn PoseSolver> + Send + Sync + 'static,
    ) {
        self.solvers.insert(key.into(), Box::new(constructor));
    }

    /// Builds the capabilities named by a map configuration.
    pub fn resolve(
        &self,
        config: &MapConfig,
        settings: &LocalizerSettings,
    ) -> Result<Capabilities, RegistryError> {
        fn lookup<'a, T: ?Sized>(
            table: &'a HashMap<String, Constructor<T>>,
            kind: &'static str,
            key: &str,
        ) -> Result<&'a Constructor<T>, RegistryError> {
            table.get(key).ok_or_else(|| RegistryError::UnknownCapability {
                kind,
                key: key.to_string(),
            })
        }

        let extractor = lookup(&self.extractors, "feature extractor", &config.feature_conf)?;
        let matcher = lookup(&self.matchers, "matcher", &config.matcher_conf)?;
        let solver = lookup(&self.solvers, "pose solver", &config.solver_conf)?;
        let global = config
            .retrieval_conf
            .as_deref()
            .map(|key| lookup(&self.globals, "global extractor", key))
            .transpose()?;
        Ok(Capabilities {
            extractor: extractor(settings),
            global: global.map(|constructor| constructor(settings)),
            matcher: matcher(settings),
            solver: solver(settings),
        })
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};

    #[test]
    fn builtins_resolve_and_unknown_keys_fail() {
        let registry = CapabilityRegistry::new();
        let settings = LocalizerSettings::default();
        let capabilities = registry.resolve(&MapConfig::default(), &settings).unwrap();
        assert!(capabilities.global.is_none());

        let config = MapConfig {
            retrieval_conf: Some("tiny-image".into()),
            ..Default::default()
        };
        assert!(registry.resolve(&config, &settings).unwrap().global.is_some());

        let config = MapConfig {
            matcher_conf: "superglue".into(),
            ..Default::default()
        };
        match registry.resolve(&config, &settings) {
            Err(RegistryError::UnknownCapability { kind, key }) => {
                assert_eq!(kind, "matcher");
                assert_eq!(key, "superglue");
            }
            _ => panic!("expected an unknown capability"),
        }
    }

    #[test]
    fn preprocessing_downscales_longest_side() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(400, 200));
        let (prepared, scale) = Preprocessing {
            grayscale: true,
            resize_max: Some(100),
        }
        .apply(&image);
        assert_eq!(prepared.dimensions(), (100, 50));
        assert_eq!(scale, [4.0, 4.0]);
        assert!(matches!(prepared, DynamicImage::ImageLuma8(_)));

        let small = DynamicImage::ImageLuma8(GrayImage::new(80, 60));
        let (prepared, scale) = Preprocessing {
            grayscale: false,
            resize_max: Some(100),
        }
        .apply(&small);
        assert_eq!(prepared.dimensions(), (80, 60));
        assert_eq!(scale, [1.0, 1.0]);
    }
}
