//! Query to candidate descriptor matching.

use itertools::Itertools;
use log::*;
use std::collections::HashMap;

use crate::{CapabilityError, FeatureMatcher, ImageId, LocalFeatures, Map, MapError};

/// What a matcher reports for each query keypoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matches {
    /// Candidate keypoint index, `None` when unmatched.
    pub matches: Vec<Option<usize>>,
    pub scores: Vec<f32>,
}

impl Matches {
    /// Builds matches from indices where `-1` marks an unmatched keypoint.
    pub fn from_indices(indices: &[i64], scores: Vec<f32>) -> Self {
        Self {
            matches: indices
                .iter()
                .map(|&ix| usize::try_from(ix).ok())
                .collect(),
            scores,
        }
    }

    /// Keeps valid matches, treating indices beyond `num_candidate_keypoints` as unmatched.
    pub fn correspondences(&self, num_candidate_keypoints: usize) -> Vec<Correspondence> {
        self.matches
            .iter()
            .enumerate()
            .filter_map(|(query, m)| {
                let candidate = (*m)?;
                (candidate < num_candidate_keypoints).then(|| Correspondence {
                    query,
                    candidate,
                    score: self.scores.get(query).copied().unwrap_or(0.0),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub query: usize,
    pub candidate: usize,
    pub score: f32,
}

/// Correspondences of the candidates that survived matching, in candidate order.
#[derive(Debug, Clone, Default)]
pub struct MatchedCandidates {
    pub order: Vec<ImageId>,
    pub correspondences: HashMap<ImageId, Vec<Correspondence>>,
}

impl MatchedCandidates {
    pub fn get(&self, image: ImageId) -> &[Correspondence] {
        self.correspondences
            .get(&image)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Matches the query against every candidate, dropping candidates that cannot be matched.
///
/// Returns `None` when no candidate survives.
pub fn match_candidates(
    matcher: &dyn FeatureMatcher,
    query: &LocalFeatures,
    map: &Map,
    candidates: &[ImageId],
) -> Option<MatchedCandidates> {
    let mut matched = MatchedCandidates::default();
    for &id in candidates {
        let image = match map.reconstruction().image(id) {
            Some(image) => image,
            None => {
                warn!("candidate {} is not part of the map, dropping it", id);
                continue;
            }
        };
        let features = match map.local_features(image) {
            Ok(features) => features,
            Err(MapError::MissingDescriptor(name)) => {
                warn!("no local descriptors for {}, dropping candidate", name);
                continue;
            }
            Err(e) => {
                warn!("unable to read descriptors of {}: {}", image.name, e);
                continue;
            }
        };
        match matcher.match_features(query, &features) {
            Ok(matches) => {
                let correspondences = matches.correspondences(features.len());
                debug!(
                    "matched {} query keypoints against {}",
                    correspondences.len(),
                    image.name
                );
                matched.order.push(id);
                matched.correspondences.insert(id, correspondences);
            }
            Err(e) => warn!("matching against {} failed: {}", image.name, e),
        }
    }
    if matched.is_empty() {
        None
    } else {
        Some(matched)
    }
}

/// Mutual nearest neighbors under squared euclidean distance with a ratio test.
#[derive(Debug, Clone, Copy)]
pub struct MutualNearestNeighbor {
    ratio: f32,
}

impl MutualNearestNeighbor {
    /// A `ratio` of 1.0 or more disables the ratio test.
    pub fn new(ratio: f32) -> Self {
        Self { ratio }
    }

    /// The index and distance of the closest descriptor if it passes the ratio test.
    fn nearest<'a>(
        &self,
        descriptor: &[f32],
        others: impl Iterator<Item = &'a [f32]>,
    ) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        let mut second = f32::INFINITY;
        for (ix, other) in others.enumerate() {
            let distance = squared_distance(descriptor, other);
            match best {
                Some((_, d)) if distance >= d => second = second.min(distance),
                _ => {
                    if let Some((_, d)) = best {
                        second = d;
                    }
                    best = Some((ix, distance));
                }
            }
        }
        let ratio = self.ratio * self.ratio;
        best.filter(|&(_, d)| self.ratio >= 1.0 || d < ratio * second)
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl FeatureMatcher for MutualNearestNeighbor {
    fn match_features(
        &self,
        query: &LocalFeatures,
        candidate: &LocalFeatures,
    ) -> Result<Matches, CapabilityError> {
        if query.descriptor_dim() != candidate.descriptor_dim()
            && !query.is_empty()
            && !candidate.is_empty()
        {
            return Err(CapabilityError::DimensionMismatch {
                expected: candidate.descriptor_dim(),
                actual: query.descriptor_dim(),
            });
        }
        let forward = query
            .descriptors()
            .map(|d| self.nearest(d, candidate.descriptors()))
            .collect_vec();
        let reverse = candidate
            .descriptors()
            .map(|d| self.nearest(d, query.descriptors()).map(|(ix, _)| ix))
            .collect_vec();
        let (matches, scores) = forward
            .iter()
            .enumerate()
            .map(|(qix, m)| match *m {
                Some((cix, distance)) if reverse[cix] == Some(qix) => {
                    (Some(cix), 1.0 / (1.0 + distance.sqrt()))
                }
                _ => (None, 0.0),
            })
            .unzip();
        Ok(Matches { matches, scores })
    }
}
