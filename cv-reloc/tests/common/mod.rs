#![allow(dead_code)]

use cv_core::nalgebra::{IsometryMatrix3, Point2, Point3, Rotation3, Translation3, Vector3};
use cv_core::WorldToCamera;
use cv_reloc::{
    write_text, Camera, CapabilityError, CapabilityRegistry, DescriptorContainerWriter,
    FeatureExtractor, GlobalDescriptors, GlobalExtractor, LocalFeatures, MapImage, MapPoint, Query,
    Reconstruction, TransformFile,
};
use image::DynamicImage;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::path::Path;
use std::sync::Arc;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const NUM_LANDMARKS: usize = 120;
pub const NUM_IMAGES: usize = 5;
/// Landmarks and images of the far block in the two block map.
pub const FAR_LANDMARKS: usize = 30;
pub const FAR_IMAGES: usize = 3;
pub const FAR_POINT_IDS: u64 = 1000;

pub fn camera() -> Camera {
    Camera::from_name("SIMPLE_PINHOLE", WIDTH, HEIGHT, vec![500.0, 320.0, 240.0]).unwrap()
}

pub fn pose_at(center: Vector3<f64>, rotation: Rotation3<f64>) -> WorldToCamera {
    WorldToCamera(IsometryMatrix3::from_parts(Translation3::from(center), rotation).inverse())
}

pub fn center_of(pose: &WorldToCamera) -> Vector3<f64> {
    pose.0.inverse().translation.vector
}

/// Database cameras on a line along x, all looking down +z.
pub fn database_poses() -> Vec<WorldToCamera> {
    (0..NUM_IMAGES)
        .map(|ix| {
            pose_at(
                Vector3::new(-1.0 + 0.5 * ix as f64, 0.0, 0.0),
                Rotation3::identity(),
            )
        })
        .collect()
}

/// One meter in front of the database cameras, slightly turned.
pub fn query_pose() -> WorldToCamera {
    pose_at(
        Vector3::new(0.2, 0.1, 1.0),
        Rotation3::from_euler_angles(0.02, 0.05, -0.01),
    )
}

fn in_bounds(pixel: &Point2<f64>) -> bool {
    pixel.x >= 0.0 && pixel.y >= 0.0 && pixel.x < WIDTH as f64 && pixel.y < HEIGHT as f64
}

/// Landmarks seen by every database camera and the query.
pub fn landmarks() -> Vec<Point3<f64>> {
    let mut rng = Pcg64::seed_from_u64(11);
    let camera = camera();
    let mut poses = database_poses();
    poses.push(query_pose());
    let mut points = vec![];
    while points.len() < NUM_LANDMARKS {
        let point = Point3::new(
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-1.5..1.5),
            rng.gen_range(8.0..12.0),
        );
        let visible = poses.iter().all(|pose| {
            camera
                .project(&(pose.0 * point))
                .map_or(false, |pixel| in_bounds(&pixel))
        });
        if visible {
            points.push(point);
        }
    }
    points
}

/// COLMAP pixel coordinates of every landmark.
pub fn observe(pose: &WorldToCamera, landmarks: &[Point3<f64>]) -> Vec<Point2<f64>> {
    let camera = camera();
    landmarks
        .iter()
        .filter_map(|point| camera.project(&(pose.0 * point)))
        .collect()
}

/// Features whose single descriptor value is the landmark index.
pub fn features(pixels: &[Point2<f64>]) -> LocalFeatures {
    LocalFeatures::from_rows(
        pixels
            .iter()
            .map(|p| [(p.x - 0.5) as f32, (p.y - 0.5) as f32])
            .collect(),
        vec![1.0; pixels.len()],
        1.0,
        &(0..pixels.len()).map(|ix| vec![ix as f32]).collect::<Vec<_>>(),
    )
    .unwrap()
}

pub fn image_name(ix: usize) -> String {
    format!("db_{}.jpg", ix + 1)
}

pub fn reconstruction() -> Reconstruction {
    let landmarks = landmarks();
    let images = database_poses()
        .into_iter()
        .enumerate()
        .map(|(ix, pose)| MapImage {
            id: ix as u32 + 1,
            name: image_name(ix),
            camera_id: 1,
            pose,
            keypoints: observe(&pose, &landmarks),
            point_ids: (0..landmarks.len() as u64).map(Some).collect(),
        })
        .collect::<Vec<_>>();
    let points = landmarks.iter().enumerate().map(|(ix, &position)| MapPoint {
        id: ix as u64,
        position,
        color: [(ix * 2) as u8, 128, 255],
        error: 0.5,
    });
    Reconstruction::new([(1, camera())], images, points).unwrap()
}

/// The far block repeats the first landmarks of the scene 100 m further along z.
pub fn far_offset() -> Vector3<f64> {
    Vector3::new(0.0, 0.0, 100.0)
}

/// The scene plus a smaller far block seen only by its own images.
///
/// The query sees the far block exactly as it sees the near one, so each block
/// alone yields a consistent pose and only the inlier counts tell them apart.
pub fn two_block_reconstruction() -> Reconstruction {
    let near = reconstruction();
    let far: Vec<Point3<f64>> = landmarks()[..FAR_LANDMARKS]
        .iter()
        .map(|p| p + far_offset())
        .collect();
    let mut images: Vec<MapImage> = near.images().cloned().collect();
    for (ix, pose) in database_poses().iter().take(FAR_IMAGES).enumerate() {
        let pose = pose_at(center_of(pose) + far_offset(), Rotation3::identity());
        images.push(MapImage {
            id: (NUM_IMAGES + ix) as u32 + 1,
            name: image_name(NUM_IMAGES + ix),
            camera_id: 1,
            pose,
            keypoints: observe(&pose, &far),
            point_ids: (0..FAR_LANDMARKS as u64)
                .map(|k| Some(FAR_POINT_IDS + k))
                .collect(),
        });
    }
    let points = near
        .points()
        .cloned()
        .chain(far.iter().enumerate().map(|(ix, &position)| MapPoint {
            id: FAR_POINT_IDS + ix as u64,
            position,
            color: [255, 64, 0],
            error: 0.5,
        }))
        .collect::<Vec<_>>();
    Reconstruction::new([(1, camera())], images, points).unwrap()
}

/// One-hot global descriptors, one per database image.
pub fn global_rows() -> Vec<Vec<f32>> {
    (0..NUM_IMAGES)
        .map(|ix| (0..NUM_IMAGES).map(|j| (ix == j) as u8 as f32).collect())
        .collect()
}

pub fn transform_file(latitude: f64) -> TransformFile {
    // The inverse of the graphics to robotics swap, so the map frame is ENU.
    TransformFile {
        latitude,
        longitude: 19.05,
        height: 110.0,
        matrix: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, -1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    }
}

pub fn write_transform(directory: &Path, latitude: f64) {
    let json = serde_json::to_string_pretty(&transform_file(latitude)).unwrap();
    std::fs::write(directory.join("transform.json"), json).unwrap();
}

pub struct MapLayout {
    pub global: bool,
    pub transform: bool,
    pub retrieval_conf: Option<&'static str>,
}

impl Default for MapLayout {
    fn default() -> Self {
        Self {
            global: true,
            transform: true,
            retrieval_conf: Some("fixed"),
        }
    }
}

/// Writes a complete map directory.
pub fn write_map(directory: &Path, layout: MapLayout) {
    write_map_of(directory, &reconstruction(), layout);
}

/// Writes the two block map without global descriptors, so every image is a candidate.
pub fn write_two_block_map(directory: &Path) {
    write_map_of(
        directory,
        &two_block_reconstruction(),
        MapLayout {
            global: false,
            retrieval_conf: None,
            ..MapLayout::default()
        },
    );
}

fn write_map_of(directory: &Path, reconstruction: &Reconstruction, layout: MapLayout) {
    write_text(reconstruction, directory).unwrap();

    let mut writer = DescriptorContainerWriter::create(directory.join("features.bin")).unwrap();
    for image in reconstruction.images() {
        let pixels = image.keypoints.clone();
        writer.add(image.name.clone(), &features(&pixels)).unwrap();
    }
    writer.finish().unwrap();

    if layout.global {
        let entries: Vec<(String, Vec<f32>)> = global_rows()
            .into_iter()
            .enumerate()
            .map(|(ix, row)| (image_name(ix), row))
            .collect();
        GlobalDescriptors::write(directory.join("global_features.bin"), &entries).unwrap();
    }
    if layout.transform {
        write_transform(directory, 47.5);
    }
    let config = serde_json::json!({
        "feature_conf": "fixed",
        "retrieval_conf": layout.retrieval_conf,
    });
    std::fs::write(directory.join("config.json"), config.to_string()).unwrap();
}

/// Returns the same features for every image.
pub struct FixedExtractor(pub LocalFeatures);

impl FeatureExtractor for FixedExtractor {
    fn extract_local(&self, _: &DynamicImage) -> Result<LocalFeatures, CapabilityError> {
        Ok(self.0.clone())
    }
}

/// Returns the same global descriptor for every image.
pub struct FixedGlobal(pub Vec<f32>);

impl GlobalExtractor for FixedGlobal {
    fn extract_global(&self, _: &DynamicImage) -> Result<Vec<f32>, CapabilityError> {
        Ok(self.0.clone())
    }
}

pub fn query_features() -> LocalFeatures {
    features(&observe(&query_pose(), &landmarks()))
}

/// The built-in capabilities plus `fixed` extractors answering with the synthetic query.
pub fn capabilities(global: Vec<f32>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    let local = query_features();
    registry.register_extractor("fixed", move |_| Arc::new(FixedExtractor(local.clone())));
    registry.register_global("fixed", move |_| Arc::new(FixedGlobal(global.clone())));
    registry
}

pub fn query() -> Query {
    Query {
        image: DynamicImage::new_rgb8(WIDTH, HEIGHT),
        camera_model: "SIMPLE_PINHOLE".into(),
        params: vec![500.0, 320.0, 240.0],
    }
}
