use log::*;

use crate::{CapabilityError, ImageId, Map};

/// The database images a query is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    pub images: Vec<ImageId>,
    /// False when every image is returned in map order because no ranking was possible.
    pub ranked: bool,
}

/// Indices of the `k` largest similarities, ties broken by the lower index.
///
/// NaN similarities rank last.
pub fn top_k(similarities: &[f32], k: usize) -> Vec<usize> {
    let key = |ix: usize| {
        let s = similarities[ix];
        if s.is_nan() {
            f32::NEG_INFINITY
        } else {
            s
        }
    };
    let mut order: Vec<usize> = (0..similarities.len()).collect();
    order.sort_by(|&a, &b| key(b).total_cmp(&key(a)).then(a.cmp(&b)));
    order.truncate(k.min(similarities.len()));
    order
}

/// Ranks map images by similarity to the query's global descriptor.
///
/// Without a global descriptor on either side every image is returned unranked.
/// A descriptor of the wrong dimension fails the query.
pub fn retrieve(
    map: &Map,
    query_global: Option<&[f32]>,
    k: usize,
) -> Result<Candidates, CapabilityError> {
    let order = map.reconstruction().image_order();
    match (map.global_descriptors(), query_global) {
        (Some(global), Some(query)) => {
            let similarities = global.similarities(query)?;
            let images = top_k(similarities.as_slice(), k)
                .into_iter()
                .map(|ix| order[ix])
                .collect();
            Ok(Candidates {
                images,
                ranked: true,
            })
        }
        (global, query) => {
            warn!(
                "retrieval skipped (map descriptors: {}, query descriptor: {}), using all {} images",
                global.is_some(),
                query.is_some(),
                order.len()
            );
            Ok(Candidates {
                images: order.to_vec(),
                ranked: false,
            })
        }
    }
}
