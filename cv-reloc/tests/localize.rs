mod common;

use common::*;
use cv_reloc::geodesy::geodetic_to_enu;
use cv_reloc::{
    covisibility_clusters, CapabilityError, CapabilityRegistry, FailureKind, FeatureMatcher,
    LocalFeatures, Localize, Localizer, LocalizerSettings, MapCalibration, MapRegistry, Matches,
    MutualNearestNeighbor, Stage,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn registry(settings: LocalizerSettings) -> MapRegistry {
    MapRegistry::new(capabilities(global_rows()[2].clone()), settings)
}

#[test]
fn localizes_one_meter_from_the_database() {
    let _ = pretty_env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let registry = registry(LocalizerSettings::default());
    registry.load("synthetic", dir.path()).unwrap();

    let localizer = registry.localizer("synthetic").unwrap();
    let localization = localizer.localize(&query()).unwrap();
    assert!(!localization.degraded);
    assert!(localization.num_inliers >= 100);
    assert_eq!(localization.images.len(), NUM_IMAGES);
    let error = (center_of(&localization.pose) - center_of(&query_pose())).norm();
    assert!(error < 0.05, "camera center is off by {} m", error);

    let calibration = MapCalibration::load(dir.path().join("transform.json")).unwrap();
    let expected = cv_reloc::to_geopose(&query_pose(), &calibration);
    let offset = geodetic_to_enu(&localization.geopose.position, &expected.position);
    assert!(offset.norm() < 0.05, "geopose is off by {} m", offset.norm());

    let geopose = registry.localize(&query()).unwrap();
    assert_eq!(geopose, localization.geopose);
}

#[test]
fn repeated_queries_agree() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let localizer = registry(LocalizerSettings::default()).open(dir.path()).unwrap();
    let first = localizer.localize(&query()).unwrap();
    let second = localizer.localize(&query()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn geopose_is_on_the_globe() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let localizer = registry(LocalizerSettings::default()).open(dir.path()).unwrap();
    let geopose = localizer.localize(&query()).unwrap().geopose;
    let position = geopose.position;
    assert!((-90.0..=90.0).contains(&position.lat));
    assert!((-180.0..=180.0).contains(&position.lon));
    assert!((position.lat - 47.5).abs() < 1e-3);
    assert!((position.h - 110.0).abs() < 5.0);
    let q = geopose.quaternion;
    let norm = (q.x * q.x + q.y * q.y + q.z * q.z + q.w * q.w).sqrt();
    assert!((norm - 1.0).abs() < 1e-9);
}

/// Fails the first candidate it is given and matches the rest normally.
struct FailsFirst {
    calls: AtomicUsize,
    inner: MutualNearestNeighbor,
}

impl FeatureMatcher for FailsFirst {
    fn match_features(
        &self,
        query: &LocalFeatures,
        candidate: &LocalFeatures,
    ) -> Result<Matches, CapabilityError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(CapabilityError::Matching("simulated failure".into()));
        }
        self.inner.match_features(query, candidate)
    }
}

#[test]
fn survives_one_failing_candidate() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let mut capabilities = capabilities(global_rows()[0].clone());
    capabilities.register_matcher("fails-first", |s| {
        Arc::new(FailsFirst {
            calls: AtomicUsize::new(0),
            inner: MutualNearestNeighbor::new(s.matcher_ratio),
        })
    });
    let config = serde_json::json!({
        "feature_conf": "fixed",
        "retrieval_conf": "fixed",
        "matcher_conf": "fails-first",
    });
    std::fs::write(dir.path().join("config.json"), config.to_string()).unwrap();

    let localizer = MapRegistry::new(capabilities, LocalizerSettings::default())
        .open(dir.path())
        .unwrap();
    let localization = localizer.localize(&query()).unwrap();
    // Image 1 ranks first for this query and is the one that fails.
    assert!(!localization.images.contains(&1));
    assert_eq!(localization.images.len(), NUM_IMAGES - 1);
    let error = (center_of(&localization.pose) - center_of(&query_pose())).norm();
    assert!(error < 0.05);
}

#[test]
fn missing_calibration_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_map(
        dir.path(),
        MapLayout {
            transform: false,
            ..MapLayout::default()
        },
    );
    let localizer = registry(LocalizerSettings::default()).open(dir.path()).unwrap();
    let failure = localizer.localize(&query()).unwrap_err();
    assert!(failure.is_calibration_missing());
    assert_eq!(failure.stage, Stage::Transform);
}

#[test]
fn inlier_threshold_rejects_the_pose() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let settings = LocalizerSettings {
        minimum_inliers: 10_000,
        ..LocalizerSettings::default()
    };
    let localizer = registry(settings).open(dir.path()).unwrap();
    let failure = localizer.localize(&query()).unwrap_err();
    assert_eq!(failure.stage, Stage::SelectHypothesis);
    assert!(matches!(
        failure.kind,
        FailureKind::PoseRejected {
            required: 10_000,
            ..
        }
    ));
}

#[test]
fn rejected_pose_falls_back_to_nearest_candidate() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let settings = LocalizerSettings {
        minimum_inliers: 10_000,
        covisibility_clustering: false,
        fallback_to_nearest_candidate: true,
        ..LocalizerSettings::default()
    };
    let localizer = registry(settings).open(dir.path()).unwrap();
    let localization = localizer.localize(&query()).unwrap();
    assert!(localization.degraded);
    // The query global descriptor equals the one of image 3.
    assert_eq!(localization.images, vec![3]);
    assert_eq!(localization.pose, database_poses()[2]);
}

#[test]
fn bad_query_camera_fails_early() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let localizer = registry(LocalizerSettings::default()).open(dir.path()).unwrap();
    let mut query = query();
    query.params.pop();
    let failure = localizer.localize(&query).unwrap_err();
    assert_eq!(failure.stage, Stage::PreprocessQuery);
    assert!(matches!(failure.kind, FailureKind::Camera(_)));
}

/// Opens the two block map with the matcher registered under `key`.
fn open_two_blocks(dir: &Path, capabilities: CapabilityRegistry, key: &str) -> Localizer {
    write_two_block_map(dir);
    let config = serde_json::json!({
        "feature_conf": "fixed",
        "retrieval_conf": null,
        "matcher_conf": key,
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
    MapRegistry::new(capabilities, LocalizerSettings::default())
        .open(dir)
        .unwrap()
}

#[test]
fn the_cluster_with_more_inliers_wins() {
    let dir = tempfile::tempdir().unwrap();
    let capabilities = capabilities(global_rows()[0].clone());
    let localizer = open_two_blocks(dir.path(), capabilities, "mutual-nn");

    let order: Vec<u32> = (1..=(NUM_IMAGES + FAR_IMAGES) as u32).collect();
    let clusters = covisibility_clusters(localizer.map().reconstruction(), &order);
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[1], vec![6, 7, 8]);

    let localization = localizer.localize(&query()).unwrap();
    let mut images = localization.images.clone();
    images.sort_unstable();
    assert_eq!(images, vec![1, 2, 3, 4, 5]);
    assert!(localization.num_inliers > FAR_LANDMARKS);
    // The far block alone would place the query 100 m away.
    let error = (center_of(&localization.pose) - center_of(&query_pose())).norm();
    assert!(error < 0.05, "camera center is off by {} m", error);
}

/// Passes on at most three matches per candidate.
struct FirstThree(MutualNearestNeighbor);

impl FeatureMatcher for FirstThree {
    fn match_features(
        &self,
        query: &LocalFeatures,
        candidate: &LocalFeatures,
    ) -> Result<Matches, CapabilityError> {
        let mut matches = self.0.match_features(query, candidate)?;
        let mut kept = 0;
        for m in matches.matches.iter_mut().filter(|m| m.is_some()) {
            if kept == 3 {
                *m = None;
            } else {
                kept += 1;
            }
        }
        Ok(matches)
    }
}

#[test]
fn clusters_without_enough_correspondences_give_no_pose() {
    let dir = tempfile::tempdir().unwrap();
    let mut capabilities = capabilities(global_rows()[0].clone());
    capabilities.register_matcher("first-three", |s| {
        Arc::new(FirstThree(MutualNearestNeighbor::new(s.matcher_ratio)))
    });
    let localizer = open_two_blocks(dir.path(), capabilities, "first-three");

    let failure = localizer.localize(&query()).unwrap_err();
    assert_eq!(failure.stage, Stage::SelectHypothesis);
    assert!(matches!(
        failure.kind,
        FailureKind::NoViableClusters { attempted: 2 }
    ));
}

/// Fails every candidate.
struct Broken;

impl FeatureMatcher for Broken {
    fn match_features(
        &self,
        _: &LocalFeatures,
        _: &LocalFeatures,
    ) -> Result<Matches, CapabilityError> {
        Err(CapabilityError::Matching("simulated failure".into()))
    }
}

#[test]
fn every_candidate_failing_to_match_gives_no_pose() {
    let dir = tempfile::tempdir().unwrap();
    let mut capabilities = capabilities(global_rows()[0].clone());
    capabilities.register_matcher("broken", |_| Arc::new(Broken));
    let localizer = open_two_blocks(dir.path(), capabilities, "broken");

    let failure = localizer.localize(&query()).unwrap_err();
    assert_eq!(failure.stage, Stage::Match);
    assert!(matches!(
        failure.kind,
        FailureKind::AllCandidatesFailed {
            attempted
        } if attempted == NUM_IMAGES + FAR_IMAGES
    ));
}
