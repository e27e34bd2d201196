//! Multi-frame consistency aggregation.
//!
//! Combines per-frame matcher verdicts into one identity claim or a
//! structured rejection. The check order is load-bearing: proxy signals
//! short-circuit before confidence averaging, so a proxy attempt can never
//! be masked by averaging it with a genuine match.

use std::collections::HashMap;
use std::sync::Arc;

use crate::matcher::FrameResult;
use crate::policy::ThresholdPolicy;
use crate::types::Identity;

/// A consistent single-identity claim across the matched frames.
#[derive(Debug, Clone)]
pub struct AggregatedClaim {
    pub identity: Identity,
    /// Mean confidence over the frames that matched this identity.
    pub avg_confidence: f64,
    pub frames_matched: usize,
    pub total_frames: usize,
}

/// Outcome of aggregating one frame sequence.
#[derive(Debug, Clone)]
pub enum Aggregation {
    Consistent(AggregatedClaim),
    /// At least one frame showed more than one face. Dominates every other
    /// signal.
    MultipleFaces { frames: usize, total: usize },
    /// Distinct identities among the matched frames beyond the configured
    /// switch tolerance.
    IdentitySwitch {
        identities: Vec<String>,
        frames_matched: usize,
        total: usize,
    },
    /// Every frame reported no candidate face. Not a proxy signal.
    NoFace { total: usize },
    /// Fewer matched frames than the policy requires.
    InsufficientFrames {
        matched: usize,
        required: usize,
        total: usize,
    },
}

/// Combines N per-frame matcher outputs into one verified identity claim or
/// a structured rejection.
pub struct FrameConsistencyAggregator {
    policy: Arc<ThresholdPolicy>,
}

impl FrameConsistencyAggregator {
    pub fn new(policy: Arc<ThresholdPolicy>) -> Self {
        Self { policy }
    }

    /// Aggregate an ordered frame sequence (minimum 1 frame; the caller
    /// guards against empty input).
    pub fn aggregate(&self, results: &[FrameResult]) -> Aggregation {
        let total = results.len();

        let multi_face_frames = results
            .iter()
            .filter(|r| matches!(r, FrameResult::MultipleFaces { .. }))
            .count();
        if multi_face_frames > 0 {
            return Aggregation::MultipleFaces {
                frames: multi_face_frames,
                total,
            };
        }

        let no_face_frames = results
            .iter()
            .filter(|r| matches!(r, FrameResult::NoFace))
            .count();
        if no_face_frames == total {
            return Aggregation::NoFace { total };
        }

        // Only matched frames carry evidence from here on; per-frame oracle
        // errors are skipped (they already logged their own reason).
        let matched: Vec<(&Identity, f64)> = results
            .iter()
            .filter_map(|r| match r {
                FrameResult::Matched {
                    identity,
                    confidence,
                    ..
                } => Some((identity, *confidence)),
                _ => None,
            })
            .collect();

        if matched.len() < self.policy.required_consistent_frames {
            return Aggregation::InsufficientFrames {
                matched: matched.len(),
                required: self.policy.required_consistent_frames,
                total,
            };
        }

        // Majority identity by student id; frames disagreeing with it count
        // as switches.
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (identity, _) in &matched {
            *counts.entry(identity.student_id.as_str()).or_default() += 1;
        }
        let (majority_id, majority_count) = counts
            .iter()
            .max_by_key(|(_, n)| **n)
            .map(|(id, n)| (*id, *n))
            .unwrap_or(("", 0));

        let switches = matched.len() - majority_count;
        if switches > self.policy.max_identity_switches {
            let identities: Vec<String> = matched
                .iter()
                .map(|(i, _)| i.name.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            return Aggregation::IdentitySwitch {
                identities,
                frames_matched: matched.len(),
                total,
            };
        }

        let majority: Vec<&(&Identity, f64)> = matched
            .iter()
            .filter(|(i, _)| i.student_id == majority_id)
            .collect();
        let avg_confidence =
            majority.iter().map(|(_, c)| *c).sum::<f64>() / majority.len() as f64;
        let identity = majority[0].0.clone();

        Aggregation::Consistent(AggregatedClaim {
            identity,
            avg_confidence,
            frames_matched: matched.len(),
            total_frames: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(id: &str) -> Identity {
        Identity {
            student_id: id.to_string(),
            name: id.to_uppercase(),
            roll_number: format!("R-{id}"),
        }
    }

    fn matched(id: &str, confidence: f64) -> FrameResult {
        FrameResult::Matched {
            identity: ident(id),
            confidence,
            bbox: None,
        }
    }

    fn aggregator() -> FrameConsistencyAggregator {
        FrameConsistencyAggregator::new(Arc::new(ThresholdPolicy::default()))
    }

    #[test]
    fn multi_face_dominates_high_confidence_matches() {
        let frames = vec![
            matched("ash", 95.0),
            FrameResult::MultipleFaces { count: 2 },
            matched("ash", 97.0),
            matched("ash", 96.0),
        ];
        match aggregator().aggregate(&frames) {
            Aggregation::MultipleFaces { frames, total } => {
                assert_eq!(frames, 1);
                assert_eq!(total, 4);
            }
            other => panic!("expected MultipleFaces, got {other:?}"),
        }
    }

    #[test]
    fn all_no_face_is_distinct_from_proxy() {
        let frames = vec![FrameResult::NoFace, FrameResult::NoFace, FrameResult::NoFace];
        assert!(matches!(
            aggregator().aggregate(&frames),
            Aggregation::NoFace { total: 3 }
        ));
    }

    #[test]
    fn two_of_five_matched_is_insufficient() {
        let frames = vec![
            matched("ash", 90.0),
            FrameResult::NoFace,
            matched("ash", 92.0),
            FrameResult::NoFace,
            FrameResult::NoFace,
        ];
        match aggregator().aggregate(&frames) {
            Aggregation::InsufficientFrames {
                matched,
                required,
                total,
            } => {
                assert_eq!(matched, 2);
                assert_eq!(required, 3);
                assert_eq!(total, 5);
            }
            other => panic!("expected InsufficientFrames, got {other:?}"),
        }
    }

    #[test]
    fn identity_switch_flagged_even_when_both_confident() {
        let frames = vec![
            matched("ash", 95.0),
            matched("ash", 94.0),
            matched("kai", 96.0),
            matched("kai", 97.0),
        ];
        match aggregator().aggregate(&frames) {
            Aggregation::IdentitySwitch { identities, .. } => {
                assert_eq!(identities.len(), 2);
            }
            other => panic!("expected IdentitySwitch, got {other:?}"),
        }
    }

    #[test]
    fn consistent_identity_averages_confidence() {
        let frames = vec![matched("ash", 80.0), matched("ash", 90.0), matched("ash", 100.0)];
        match aggregator().aggregate(&frames) {
            Aggregation::Consistent(claim) => {
                assert_eq!(claim.identity.student_id, "ash");
                assert!((claim.avg_confidence - 90.0).abs() < 1e-9);
                assert_eq!(claim.frames_matched, 3);
                assert_eq!(claim.total_frames, 3);
            }
            other => panic!("expected Consistent, got {other:?}"),
        }
    }

    #[test]
    fn switch_tolerance_averages_majority_only() {
        let policy = ThresholdPolicy {
            max_identity_switches: 1,
            ..ThresholdPolicy::default()
        };
        let agg = FrameConsistencyAggregator::new(Arc::new(policy));
        let frames = vec![
            matched("ash", 80.0),
            matched("ash", 90.0),
            matched("ash", 100.0),
            matched("kai", 10.0),
        ];
        match agg.aggregate(&frames) {
            Aggregation::Consistent(claim) => {
                assert_eq!(claim.identity.student_id, "ash");
                // The stray frame is excluded from the average
                assert!((claim.avg_confidence - 90.0).abs() < 1e-9);
                assert_eq!(claim.frames_matched, 4);
            }
            other => panic!("expected Consistent, got {other:?}"),
        }
    }

    #[test]
    fn oracle_error_frames_are_skipped_not_counted_as_no_face() {
        let frames = vec![
            matched("ash", 90.0),
            FrameResult::Error {
                message: "decode failed".to_string(),
            },
            matched("ash", 92.0),
            matched("ash", 94.0),
        ];
        match aggregator().aggregate(&frames) {
            Aggregation::Consistent(claim) => {
                assert_eq!(claim.frames_matched, 3);
                assert_eq!(claim.total_frames, 4);
            }
            other => panic!("expected Consistent, got {other:?}"),
        }
    }

    #[test]
    fn all_error_frames_count_as_insufficient() {
        let frames = vec![
            FrameResult::Error {
                message: "decode failed".to_string(),
            },
            FrameResult::NoFace,
        ];
        assert!(matches!(
            aggregator().aggregate(&frames),
            Aggregation::InsufficientFrames { matched: 0, .. }
        ));
    }
}
