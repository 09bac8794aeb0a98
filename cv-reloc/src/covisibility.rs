use log::*;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::{ImageId, Reconstruction};

/// Splits candidates into groups of images connected by shared 3D points.
///
/// Clusters are seeded in candidate order and grown breadth first; only other
/// candidates can join a cluster. Candidates without any 3D point are dropped.
pub fn covisibility_clusters(
    reconstruction: &Reconstruction,
    candidates: &[ImageId],
) -> Vec<Vec<ImageId>> {
    let rank: HashMap<ImageId, usize> = candidates
        .iter()
        .enumerate()
        .rev()
        .map(|(ix, &id)| (id, ix))
        .collect();
    let mut visited: HashSet<ImageId> = HashSet::new();
    let mut clusters = vec![];

    for &seed in candidates {
        if !visited.insert(seed) {
            continue;
        }
        match reconstruction.image(seed) {
            Some(image) if image.num_points3d() > 0 => {}
            Some(image) => {
                warn!("{} observes no 3D points, leaving it out of clustering", image.name);
                continue;
            }
            None => continue,
        }

        let mut cluster = vec![];
        let mut queue = VecDeque::from([seed]);
        while let Some(id) = queue.pop_front() {
            cluster.push(id);
            let image = match reconstruction.image(id) {
                Some(image) => image,
                None => continue,
            };
            let mut neighbors: Vec<ImageId> = image
                .point_ids
                .iter()
                .flatten()
                .flat_map(|&point| reconstruction.observers(point))
                .copied()
                .filter(|other| rank.contains_key(other) && !visited.contains(other))
                .collect();
            neighbors.sort_unstable_by_key(|other| rank[other]);
            neighbors.dedup();
            for other in neighbors {
                visited.insert(other);
                queue.push_back(other);
            }
        }
        debug!("covisibility cluster {:?}", cluster);
        clusters.push(cluster);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Camera, MapImage, MapPoint};
    use cv_core::nalgebra::{IsometryMatrix3, Point2, Point3};
    use cv_core::WorldToCamera;

    fn image(id: ImageId, points: &[u64]) -> MapImage {
        MapImage {
            id,
            name: format!("{}.jpg", id),
            camera_id: 1,
            pose: WorldToCamera(IsometryMatrix3::identity()),
            keypoints: points.iter().map(|_| Point2::origin()).collect(),
            point_ids: points.iter().map(|&p| Some(p)).collect(),
        }
    }

    fn reconstruction(images: Vec<MapImage>) -> Reconstruction {
        let camera = Camera::from_name("SIMPLE_PINHOLE", 100, 100, vec![50.0, 50.0, 50.0]).unwrap();
        let points = (0..10).map(|id| MapPoint {
            id,
            position: Point3::origin(),
            color: [0; 3],
            error: 0.0,
        });
        Reconstruction::new([(1, camera)], images, points).unwrap()
    }

    #[test]
    fn shared_points_connect_transitively() {
        // 1-2 share point 0, 2-3 share point 1, 4 is alone, 5 has no points.
        let r = reconstruction(vec![
            image(1, &[0]),
            image(2, &[0, 1]),
            image(3, &[1]),
            image(4, &[5]),
            image(5, &[]),
        ]);
        let clusters = covisibility_clusters(&r, &[3, 4, 1, 5, 2]);
        assert_eq!(clusters, vec![vec![3, 2, 1], vec![4]]);
    }

    #[test]
    fn only_candidates_join_clusters() {
        // 1 and 3 are only connected through 2, which was not retrieved.
        let r = reconstruction(vec![image(1, &[0]), image(2, &[0, 1]), image(3, &[1])]);
        let clusters = covisibility_clusters(&r, &[1, 3]);
        assert_eq!(clusters, vec![vec![1], vec![3]]);
    }
}
