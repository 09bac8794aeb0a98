use cv_core::nalgebra::{Point3, Vector3};
use cv_core::WorldToCamera;
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use std::io::Write;

use crate::{Camera, Map};

const MAP_CAMERA_COLOR: [u8; 3] = [255, 0, 255];
const QUERY_CAMERA_COLOR: [u8; 3] = [0, 255, 0];
/// Depth of the drawn frusta in map units.
const FRUSTUM_DEPTH: f64 = 0.3;

/// A camera frustum to draw.
pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub up_direction: Vector3<f64>,
    pub forward_direction: Vector3<f64>,
    pub right_direction: Vector3<f64>,
    /// Half extents of the image plane at unit depth.
    pub half_width: f64,
    pub half_height: f64,
    pub color: [u8; 3],
}

impl ExportCamera {
    pub fn from_pose(pose: &WorldToCamera, camera: &Camera, color: [u8; 3]) -> Self {
        let camera_to_world = pose.0.inverse();
        let focals = camera.focals();
        Self {
            optical_center: camera_to_world * Point3::origin(),
            up_direction: camera_to_world * -Vector3::y(),
            forward_direction: camera_to_world * Vector3::z(),
            right_direction: camera_to_world * Vector3::x(),
            half_width: 0.5 * camera.width as f64 / focals.x,
            half_height: 0.5 * camera.height as f64 / focals.y,
            color,
        }
    }
}

/// Writes the map points and camera frusta of `map`, plus an optional localized query camera.
pub fn export_map(
    writer: impl Write,
    map: &Map,
    query: Option<(&WorldToCamera, &Camera)>,
) -> std::io::Result<usize> {
    let reconstruction = map.reconstruction();
    let mut cameras: Vec<ExportCamera> = reconstruction
        .images()
        .filter_map(|image| {
            let camera = reconstruction.camera(image.camera_id)?;
            Some(ExportCamera::from_pose(&image.pose, camera, MAP_CAMERA_COLOR))
        })
        .collect();
    if let Some((pose, camera)) = query {
        cameras.push(ExportCamera::from_pose(pose, camera, QUERY_CAMERA_COLOR));
    }
    let mut points: Vec<_> = reconstruction.points().map(|p| (p.id, p.position, p.color)).collect();
    points.sort_unstable_by_key(|&(id, _, _)| id);
    export(
        writer,
        points.into_iter().map(|(_, position, color)| (position, color)),
        cameras,
    )
}

/// Writes an ASCII PLY file with colored points and one pyramid of faces per camera.
pub fn export(
    mut writer: impl Write,
    points_and_colors: impl IntoIterator<Item = (Point3<f64>, [u8; 3])>,
    cameras: Vec<ExportCamera>,
) -> std::io::Result<usize> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from cv-reloc".to_string());

    let mut point_element = ElementDef::new("vertex".to_string());
    for axis in ["x", "y", "z"] {
        let p = PropertyDef::new(axis.to_string(), PropertyType::Scalar(ScalarType::Double));
        point_element.properties.add(p);
    }
    for channel in ["red", "green", "blue"] {
        let p = PropertyDef::new(channel.to_string(), PropertyType::Scalar(ScalarType::UChar));
        point_element.properties.add(p);
    }
    ply.header.elements.add(point_element);

    let mut face_element = ElementDef::new("face".to_string());
    let vertex_list = PropertyDef::new(
        "vertex_index".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    );
    face_element.properties.add(vertex_list);
    ply.header.elements.add(face_element);

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };

    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    for camera in &cameras {
        let center = add_vertex(camera.optical_center, camera.color);
        let [up_right, up_left, down_left, down_right] =
            [(1.0, 1.0), (1.0, -1.0), (-1.0, -1.0), (-1.0, 1.0)].map(|(up, right): (f64, f64)| {
                add_vertex(
                    camera.optical_center
                        + FRUSTUM_DEPTH
                            * (camera.forward_direction
                                + up * camera.half_height * camera.up_direction
                                + right * camera.half_width * camera.right_direction),
                    camera.color,
                )
            });
        add_triangle(center, down_right, up_right);
        add_triangle(center, up_right, up_left);
        add_triangle(center, up_left, down_left);
        add_triangle(center, down_left, down_right);
    }

    for (p, c) in points_and_colors {
        add_vertex(p, c);
    }

    ply.payload.insert("vertex".to_string(), vertices);
    ply.payload.insert("face".to_string(), faces);

    Writer::new().write_ply(&mut writer, &mut ply)
}
