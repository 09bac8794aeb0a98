use serde::{Deserialize, Serialize};

/// The settings for the localization process.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizerSettings {
    /// The number of database images retrieved per query
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    /// The maximum reprojection error in pixels for a correspondence to count as an inlier
    #[serde(default = "default_ransac_max_error")]
    pub ransac_max_error: f64,
    /// The minimum number of inliers for a pose to be accepted
    #[serde(default = "default_minimum_inliers")]
    pub minimum_inliers: usize,
    /// Solve one pose per covisibility cluster instead of one pooled pose
    #[serde(default = "default_covisibility_clustering")]
    pub covisibility_clustering: bool,
    /// Refine the focal length of the query camera along with the pose
    #[serde(default = "default_refine_focal_length")]
    pub refine_focal_length: bool,
    /// Refine the distortion parameters of the query camera along with the pose
    #[serde(default = "default_refine_extra_params")]
    pub refine_extra_params: bool,
    /// When the pooled solve fails, answer with the stored pose of the first candidate
    #[serde(default = "default_fallback_to_nearest_candidate")]
    pub fallback_to_nearest_candidate: bool,
    /// The seed of the consensus random number generator
    #[serde(default = "default_consensus_seed")]
    pub consensus_seed: u64,
    /// The patience of the Levenberg-Marquardt refinement
    #[serde(default = "default_refinement_patience")]
    pub refinement_patience: usize,
    /// The Lowe ratio used by the built-in matcher
    #[serde(default = "default_matcher_ratio")]
    pub matcher_ratio: f32,
    /// The threshold used for akaze
    #[serde(default = "default_akaze_threshold")]
    pub akaze_threshold: f64,
    /// Images larger than this are downscaled before akaze extraction
    #[serde(default)]
    pub akaze_resize_max: Option<u32>,
    /// The side of the thumbnail used for the built-in global descriptor
    #[serde(default = "default_tiny_image_side")]
    pub tiny_image_side: u32,
}

impl Default for LocalizerSettings {
    fn default() -> Self {
        Self {
            retrieval_top_k: default_retrieval_top_k(),
            ransac_max_error: default_ransac_max_error(),
            minimum_inliers: default_minimum_inliers(),
            covisibility_clustering: default_covisibility_clustering(),
            refine_focal_length: default_refine_focal_length(),
            refine_extra_params: default_refine_extra_params(),
            fallback_to_nearest_candidate: default_fallback_to_nearest_candidate(),
            consensus_seed: default_consensus_seed(),
            refinement_patience: default_refinement_patience(),
            matcher_ratio: default_matcher_ratio(),
            akaze_threshold: default_akaze_threshold(),
            akaze_resize_max: None,
            tiny_image_side: default_tiny_image_side(),
        }
    }
}

fn default_retrieval_top_k() -> usize {
    20
}

fn default_ransac_max_error() -> f64 {
    12.0
}

fn default_minimum_inliers() -> usize {
    20
}

fn default_covisibility_clustering() -> bool {
    true
}

fn default_refine_focal_length() -> bool {
    true
}

fn default_refine_extra_params() -> bool {
    true
}

fn default_fallback_to_nearest_candidate() -> bool {
    false
}

fn default_consensus_seed() -> u64 {
    0x5eed_ca11_ab1e
}

fn default_refinement_patience() -> usize {
    100
}

fn default_matcher_ratio() -> f32 {
    0.8
}

fn default_akaze_threshold() -> f64 {
    0.001
}

fn default_tiny_image_side() -> u32 {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let settings: LocalizerSettings =
            serde_json::from_str(r#"{"minimum_inliers": 12, "covisibility_clustering": false}"#)
                .unwrap();
        assert_eq!(settings.minimum_inliers, 12);
        assert!(!settings.covisibility_clustering);
        assert_eq!(settings.retrieval_top_k, 20);
        assert_eq!(settings.ransac_max_error, 12.0);
        assert!(!settings.fallback_to_nearest_candidate);
    }
}
