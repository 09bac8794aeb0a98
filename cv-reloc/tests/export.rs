mod common;

use common::*;
use cv_reloc::{export_map, Map};

#[test]
fn writes_points_and_frusta() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), MapLayout::default());
    let map = Map::load(dir.path()).unwrap();

    let mut ply = vec![];
    export_map(&mut ply, &map, Some((&query_pose(), &camera()))).unwrap();
    let text = String::from_utf8(ply).unwrap();
    let cameras = NUM_IMAGES + 1;
    assert!(text.starts_with("ply"));
    assert!(text.contains(&format!(
        "element vertex {}",
        NUM_LANDMARKS + 5 * cameras
    )));
    assert!(text.contains(&format!("element face {}", 4 * cameras)));
    assert!(text.contains("property uchar red"));
}
