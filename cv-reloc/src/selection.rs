use crate::{Attempt, PoseHypothesis};

/// The solved attempt with strictly the most inliers; the earliest wins a tie.
pub fn best_hypothesis<'a>(attempts: impl IntoIterator<Item = &'a Attempt>) -> Option<&'a PoseHypothesis> {
    let mut best: Option<&PoseHypothesis> = None;
    for attempt in attempts {
        if let Attempt::Solved(hypothesis) = attempt {
            if best.map_or(true, |b| hypothesis.num_inliers() > b.num_inliers()) {
                best = Some(hypothesis);
            }
        }
    }
    best
}

/// Why no hypothesis was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoHypothesis,
    TooFewInliers { inliers: usize, required: usize },
}

/// Picks the best hypothesis and checks it against the inlier threshold.
pub fn select_hypothesis(
    attempts: &[Attempt],
    minimum_inliers: usize,
) -> Result<&PoseHypothesis, Rejection> {
    let best = best_hypothesis(attempts).ok_or(Rejection::NoHypothesis)?;
    if best.num_inliers() < minimum_inliers {
        return Err(Rejection::TooFewInliers {
            inliers: best.num_inliers(),
            required: minimum_inliers,
        });
    }
    Ok(best)
}
