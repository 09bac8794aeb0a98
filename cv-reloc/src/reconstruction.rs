//! The sparse reconstruction of a map, read from the COLMAP text format.
//!
//! A reconstruction directory holds `cameras.txt`, `images.txt` and
//! `points3D.txt`. Images keep their COLMAP keypoint coordinates, which place
//! the center of the top-left pixel at `(0.5, 0.5)`.

use cv_core::nalgebra::{
    IsometryMatrix3, Point2, Point3, Quaternion, Translation3, UnitQuaternion,
};
use cv_core::WorldToCamera;
use log::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::camera::Camera;
use crate::MapError;

pub type CameraId = u32;
pub type ImageId = u32;
pub type PointId = u64;

/// A triangulated landmark.
#[derive(Debug, Clone, PartialEq)]
pub struct MapPoint {
    pub id: PointId,
    pub position: Point3<f64>,
    pub color: [u8; 3],
    pub error: f64,
}

/// A registered database image.
#[derive(Debug, Clone, PartialEq)]
pub struct MapImage {
    pub id: ImageId,
    pub name: String,
    pub camera_id: CameraId,
    pub pose: WorldToCamera,
    /// Keypoints in COLMAP pixel coordinates.
    pub keypoints: Vec<Point2<f64>>,
    /// For every keypoint, the landmark it observes.
    pub point_ids: Vec<Option<PointId>>,
}

impl MapImage {
    pub fn num_points3d(&self) -> usize {
        self.point_ids.iter().flatten().count()
    }

    pub fn point_id(&self, keypoint: usize) -> Option<PointId> {
        self.point_ids.get(keypoint).copied().flatten()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    cameras: BTreeMap<CameraId, Camera>,
    images: BTreeMap<ImageId, MapImage>,
    points: HashMap<PointId, MapPoint>,
    by_name: HashMap<String, ImageId>,
    observers: HashMap<PointId, Vec<ImageId>>,
    order: Vec<ImageId>,
}

impl Reconstruction {
    /// Assembles a reconstruction.
    ///
    /// Observations of points that do not exist are removed so that every
    /// remaining keypoint link resolves.
    pub fn new(
        cameras: impl IntoIterator<Item = (CameraId, Camera)>,
        images: impl IntoIterator<Item = MapImage>,
        points: impl IntoIterator<Item = MapPoint>,
    ) -> Result<Self, MapError> {
        let cameras: BTreeMap<CameraId, Camera> = cameras.into_iter().collect();
        let points: HashMap<PointId, MapPoint> = points.into_iter().map(|p| (p.id, p)).collect();
        let mut reconstruction = Self {
            cameras,
            points,
            ..Default::default()
        };
        let mut dangling = 0;
        for mut image in images {
            if !reconstruction.cameras.contains_key(&image.camera_id) {
                return Err(MapError::Inconsistent(format!(
                    "image {} references unknown camera {}",
                    image.name, image.camera_id
                )));
            }
            if image.point_ids.len() != image.keypoints.len() {
                return Err(MapError::Inconsistent(format!(
                    "image {} has {} keypoints but {} point links",
                    image.name,
                    image.keypoints.len(),
                    image.point_ids.len()
                )));
            }
            for link in image.point_ids.iter_mut() {
                if let Some(id) = *link {
                    if !reconstruction.points.contains_key(&id) {
                        *link = None;
                        dangling += 1;
                    }
                }
            }
            if reconstruction.images.contains_key(&image.id) {
                return Err(MapError::Inconsistent(format!(
                    "image id {} appears more than once",
                    image.id
                )));
            }
            if let Some(other) = reconstruction.by_name.get(&image.name) {
                return Err(MapError::Inconsistent(format!(
                    "images {} and {} are both named {}",
                    other, image.id, image.name
                )));
            }
            reconstruction.by_name.insert(image.name.clone(), image.id);
            reconstruction.images.insert(image.id, image);
        }
        if dangling > 0 {
            warn!(
                "dropped {} keypoint links to points missing from the reconstruction",
                dangling
            );
        }
        reconstruction.order = reconstruction.images.keys().copied().collect();
        for image in reconstruction.images.values() {
            for id in image.point_ids.iter().flatten() {
                let observers = reconstruction.observers.entry(*id).or_default();
                if observers.last() != Some(&image.id) {
                    observers.push(image.id);
                }
            }
        }
        Ok(reconstruction)
    }

    /// Reads `cameras.txt`, `images.txt` and `points3D.txt` from a directory.
    pub fn load(directory: impl AsRef<Path>) -> Result<Self, MapError> {
        let directory = directory.as_ref();
        let cameras = read_cameras(&directory.join("cameras.txt"))?;
        let images = read_images(&directory.join("images.txt"))?;
        let points = read_points(&directory.join("points3D.txt"))?;
        let reconstruction = Self::new(cameras, images, points)?;
        info!(
            "read reconstruction from {} with {} cameras, {} images and {} points",
            directory.display(),
            reconstruction.cameras.len(),
            reconstruction.images.len(),
            reconstruction.points.len()
        );
        Ok(reconstruction)
    }

    pub fn camera(&self, id: CameraId) -> Option<&Camera> {
        self.cameras.get(&id)
    }

    pub fn image(&self, id: ImageId) -> Option<&MapImage> {
        self.images.get(&id)
    }

    pub fn image_by_name(&self, name: &str) -> Option<&MapImage> {
        self.by_name.get(name).and_then(|id| self.images.get(id))
    }

    pub fn point(&self, id: PointId) -> Option<&MapPoint> {
        self.points.get(&id)
    }

    /// Image ids in map order, the order rows of the global descriptors follow.
    pub fn image_order(&self) -> &[ImageId] {
        &self.order
    }

    pub fn images(&self) -> impl Iterator<Item = &MapImage> + '_ {
        self.order.iter().filter_map(move |id| self.images.get(id))
    }

    pub fn points(&self) -> impl Iterator<Item = &MapPoint> + '_ {
        self.points.values()
    }

    /// Images that observe the point, each listed once.
    pub fn observers(&self, point: PointId) -> &[ImageId] {
        self.observers
            .get(&point)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }
}

fn read_lines(path: &Path) -> Result<String, MapError> {
    std::fs::read_to_string(path).map_err(|e| MapError::io(path, e))
}

fn parse_error(path: &Path, line: usize, message: impl ToString) -> MapError {
    MapError::Parse {
        path: PathBuf::from(path),
        line,
        message: message.to_string(),
    }
}

fn field<'a, T: FromStr>(
    tokens: &mut impl Iterator<Item = &'a str>,
    path: &Path,
    line: usize,
    what: &str,
) -> Result<T, MapError> {
    let token = tokens
        .next()
        .ok_or_else(|| parse_error(path, line, format!("missing {}", what)))?;
    token
        .parse()
        .map_err(|_| parse_error(path, line, format!("invalid {} {:?}", what, token)))
}

fn read_cameras(path: &Path) -> Result<Vec<(CameraId, Camera)>, MapError> {
    let text = read_lines(path)?;
    let mut cameras = vec![];
    for (ix, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lineno = ix + 1;
        let mut tokens = line.split_whitespace();
        let id: CameraId = field(&mut tokens, path, lineno, "camera id")?;
        let model = tokens
            .next()
            .ok_or_else(|| parse_error(path, lineno, "missing camera model"))?;
        let width = field(&mut tokens, path, lineno, "width")?;
        let height = field(&mut tokens, path, lineno, "height")?;
        let params = tokens
            .map(|t| {
                t.parse::<f64>()
                    .map_err(|_| parse_error(path, lineno, format!("invalid parameter {:?}", t)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let camera = Camera::from_name(model, width, height, params)
            .map_err(|e| parse_error(path, lineno, e))?;
        cameras.push((id, camera));
    }
    Ok(cameras)
}

fn read_images(path: &Path) -> Result<Vec<MapImage>, MapError> {
    let text = read_lines(path)?;
    // The keypoint line of an image may be empty, so only comments are skipped.
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim_start().starts_with('#'))
        .collect();
    let mut images = vec![];
    let mut cursor = lines.iter();
    while let Some(&(ix, header)) = cursor.next() {
        if header.trim().is_empty() {
            continue;
        }
        let lineno = ix + 1;
        let mut tokens = header.split_whitespace();
        let id: ImageId = field(&mut tokens, path, lineno, "image id")?;
        let mut q = [0.0f64; 4];
        for (v, what) in q.iter_mut().zip(["qw", "qx", "qy", "qz"]) {
            *v = field(&mut tokens, path, lineno, what)?;
        }
        let mut t = [0.0f64; 3];
        for (v, what) in t.iter_mut().zip(["tx", "ty", "tz"]) {
            *v = field(&mut tokens, path, lineno, what)?;
        }
        let camera_id: CameraId = field(&mut tokens, path, lineno, "camera id")?;
        let name = tokens.collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return Err(parse_error(path, lineno, "missing image name"));
        }
        let quaternion = Quaternion::new(q[0], q[1], q[2], q[3]);
        if !(quaternion.norm() > 0.0) {
            return Err(parse_error(path, lineno, "degenerate rotation"));
        }
        let rotation = UnitQuaternion::from_quaternion(quaternion).to_rotation_matrix();
        let pose = WorldToCamera(IsometryMatrix3::from_parts(
            Translation3::new(t[0], t[1], t[2]),
            rotation,
        ));

        let mut keypoints = vec![];
        let mut point_ids = vec![];
        if let Some(&(kix, observations)) = cursor.next() {
            let klineno = kix + 1;
            let tokens: Vec<&str> = observations.split_whitespace().collect();
            if tokens.len() % 3 != 0 {
                return Err(parse_error(
                    path,
                    klineno,
                    "keypoint line must hold X Y POINT3D_ID triples",
                ));
            }
            for triple in tokens.chunks(3) {
                let mut it = triple.iter().copied();
                let x: f64 = field(&mut it, path, klineno, "keypoint x")?;
                let y: f64 = field(&mut it, path, klineno, "keypoint y")?;
                let point: i64 = field(&mut it, path, klineno, "point id")?;
                keypoints.push(Point2::new(x, y));
                point_ids.push(u64::try_from(point).ok());
            }
        }
        images.push(MapImage {
            id,
            name,
            camera_id,
            pose,
            keypoints,
            point_ids,
        });
    }
    Ok(images)
}

fn read_points(path: &Path) -> Result<Vec<MapPoint>, MapError> {
    let text = read_lines(path)?;
    let mut points = vec![];
    for (ix, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lineno = ix + 1;
        let mut tokens = line.split_whitespace();
        let id: PointId = field(&mut tokens, path, lineno, "point id")?;
        let x = field(&mut tokens, path, lineno, "x")?;
        let y = field(&mut tokens, path, lineno, "y")?;
        let z = field(&mut tokens, path, lineno, "z")?;
        let r = field(&mut tokens, path, lineno, "red")?;
        let g = field(&mut tokens, path, lineno, "green")?;
        let b = field(&mut tokens, path, lineno, "blue")?;
        let error = field(&mut tokens, path, lineno, "error")?;
        // The track is implied by the image observations.
        points.push(MapPoint {
            id,
            position: Point3::new(x, y, z),
            color: [r, g, b],
            error,
        });
    }
    Ok(points)
}

/// Writes a reconstruction in the COLMAP text format.
pub fn write_text(reconstruction: &Reconstruction, directory: impl AsRef<Path>) -> Result<(), MapError> {
    use std::fmt::Write;

    let directory = directory.as_ref();
    let mut cameras = String::from("# CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]\n");
    for (id, camera) in &reconstruction.cameras {
        let params = camera.params().iter().map(|p| format!("{:?}", p)).collect::<Vec<_>>().join(" ");
        let _ = writeln!(cameras, "{} {} {} {} {}", id, camera.model, camera.width, camera.height, params);
    }

    let mut images = String::from(
        "# IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME\n# POINTS2D[] as (X, Y, POINT3D_ID)\n",
    );
    let mut tracks: BTreeMap<PointId, Vec<(ImageId, usize)>> = BTreeMap::new();
    for image in reconstruction.images() {
        let q = UnitQuaternion::from_rotation_matrix(&image.pose.0.rotation);
        let t = image.pose.0.translation.vector;
        let _ = writeln!(
            images,
            "{} {:?} {:?} {:?} {:?} {:?} {:?} {:?} {} {}",
            image.id, q.w, q.i, q.j, q.k, t.x, t.y, t.z, image.camera_id, image.name
        );
        let observations = image
            .keypoints
            .iter()
            .zip(&image.point_ids)
            .enumerate()
            .map(|(ix, (kp, id))| {
                if let Some(id) = id {
                    tracks.entry(*id).or_default().push((image.id, ix));
                }
                let id = id.map_or(-1, |id| id as i64);
                format!("{:?} {:?} {}", kp.x, kp.y, id)
            })
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(images, "{}", observations);
    }

    let mut points = String::from("# POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)\n");
    let mut ids: Vec<PointId> = reconstruction.points.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let p = &reconstruction.points[&id];
        let track = tracks
            .get(&id)
            .map(|t| t.iter().map(|(i, k)| format!("{} {}", i, k)).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        let _ = writeln!(
            points,
            "{} {:?} {:?} {:?} {} {} {} {:?} {}",
            id, p.position.x, p.position.y, p.position.z, p.color[0], p.color[1], p.color[2], p.error, track
        );
    }

    for (name, contents) in [("cameras.txt", cameras), ("images.txt", images), ("points3D.txt", points)] {
        let path = directory.join(name);
        std::fs::write(&path, contents).map_err(|e| MapError::io(&path, e))?;
    }
    Ok(())
}
