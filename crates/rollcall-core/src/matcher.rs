//! Nearest-neighbour resolution of a probe embedding against enrolled campers.
//!
//! Pure and synchronous: no I/O, no logging, safe to share across any number
//! of concurrent callers.

use crate::types::{cosine_similarity, euclidean_distance, CamperId, FaceEmbedding};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Two distances closer than this are treated as equal; the lower camper id wins.
pub const TIE_TOLERANCE: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe embedding is empty")]
    EmptyProbe,
    #[error("probe embedding contains non-finite values")]
    NonFinite,
    #[error("probe has {probe} dimensions, no candidate shares it (expected {expected})")]
    DimensionMismatch { probe: usize, expected: usize },
}

/// Distance function used to compare embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// L2 distance.
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - cosine_similarity(a, b),
            Self::Euclidean => euclidean_distance(a, b),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Monotonically decreasing map from distance to a confidence in (0, 1].
pub fn distance_to_confidence(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Outcome of matching one probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        camper_id: CamperId,
        confidence: f32,
        distance: f32,
    },
    /// No candidate, or the best one fell below the threshold.
    Unmatched { best_confidence: Option<f32> },
}

impl MatchResult {
    pub fn camper_id(&self) -> Option<CamperId> {
        match self {
            Self::Matched { camper_id, .. } => Some(*camper_id),
            Self::Unmatched { .. } => None,
        }
    }
}

/// Strategy for resolving a probe embedding against a candidate set.
pub trait Matcher {
    fn match_embedding(
        &self,
        probe: &[f32],
        candidates: &BTreeMap<CamperId, FaceEmbedding>,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Minimum-distance matcher over the full candidate set.
///
/// Every candidate is visited in ascending camper id order, so equidistant
/// candidates always resolve to the lowest id.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaceMatcher {
    pub metric: DistanceMetric,
}

impl FaceMatcher {
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric }
    }
}

impl Matcher for FaceMatcher {
    fn match_embedding(
        &self,
        probe: &[f32],
        candidates: &BTreeMap<CamperId, FaceEmbedding>,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if probe.is_empty() {
            return Err(MatchError::EmptyProbe);
        }
        if probe.iter().any(|v| !v.is_finite()) {
            return Err(MatchError::NonFinite);
        }

        let mut best: Option<(CamperId, f32)> = None;
        let mut expected_dim = None;

        for (camper_id, enrolled) in candidates {
            // Corrupt or foreign-model enrollments are not comparable; skip them.
            if enrolled.dimension() != probe.len() {
                expected_dim.get_or_insert(enrolled.dimension());
                continue;
            }
            let distance = self.metric.distance(probe, &enrolled.values);
            if !distance.is_finite() {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance - TIE_TOLERANCE,
            };
            if better {
                best = Some((*camper_id, distance));
            }
        }

        let Some((camper_id, distance)) = best else {
            if let Some(expected) = expected_dim {
                return Err(MatchError::DimensionMismatch {
                    probe: probe.len(),
                    expected,
                });
            }
            return Ok(MatchResult::Unmatched {
                best_confidence: None,
            });
        };

        let confidence = distance_to_confidence(distance);
        if confidence < threshold {
            return Ok(MatchResult::Unmatched {
                best_confidence: Some(confidence),
            });
        }

        Ok(MatchResult::Matched {
            camper_id,
            confidence,
            distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CampId, GroupId};

    fn enrolled(id: i64, values: Vec<f32>) -> (CamperId, FaceEmbedding) {
        (
            CamperId(id),
            FaceEmbedding {
                camper_id: CamperId(id),
                camp_id: CampId(1),
                group_id: GroupId(1),
                values,
            },
        )
    }

    #[test]
    fn test_best_match_is_last_candidate() {
        let candidates: BTreeMap<_, _> = [
            enrolled(1, vec![0.0, 1.0, 0.0]),
            enrolled(2, vec![0.0, 0.0, 1.0]),
            enrolled(3, vec![1.0, 0.0, 0.0]),
        ]
        .into_iter()
        .collect();

        let result = FaceMatcher::default()
            .match_embedding(&[1.0, 0.0, 0.0], &candidates, 0.6)
            .unwrap();
        match result {
            MatchResult::Matched {
                camper_id,
                confidence,
                distance,
            } => {
                assert_eq!(camper_id, CamperId(3));
                assert!(distance.abs() < 1e-6);
                assert!((confidence - 1.0).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_tie_resolves_to_lowest_camper_id() {
        let candidates: BTreeMap<_, _> = [
            enrolled(9, vec![1.0, 0.0]),
            enrolled(4, vec![1.0, 0.0]),
            enrolled(7, vec![1.0, 0.0]),
        ]
        .into_iter()
        .collect();

        let matcher = FaceMatcher::new(DistanceMetric::Euclidean);
        for _ in 0..10 {
            let result = matcher.match_embedding(&[1.0, 0.0], &candidates, 0.5).unwrap();
            assert_eq!(result.camper_id(), Some(CamperId(4)));
        }
    }

    #[test]
    fn test_below_threshold_is_unmatched() {
        let candidates: BTreeMap<_, _> = [enrolled(1, vec![0.0, 1.0])].into_iter().collect();
        let result = FaceMatcher::default()
            .match_embedding(&[1.0, 0.0], &candidates, 0.6)
            .unwrap();
        // Orthogonal: cosine distance 1.0 -> confidence 0.5
        match result {
            MatchResult::Unmatched { best_confidence } => {
                assert!((best_confidence.unwrap() - 0.5).abs() < 1e-6);
            }
            other => panic!("expected unmatched, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_candidates_is_unmatched() {
        let result = FaceMatcher::default()
            .match_embedding(&[1.0, 0.0], &BTreeMap::new(), 0.1)
            .unwrap();
        assert_eq!(
            result,
            MatchResult::Unmatched {
                best_confidence: None
            }
        );
    }

    #[test]
    fn test_corrupt_probe_is_rejected() {
        let candidates: BTreeMap<_, _> = [enrolled(1, vec![1.0, 0.0])].into_iter().collect();
        let matcher = FaceMatcher::default();
        assert_eq!(
            matcher.match_embedding(&[], &candidates, 0.5),
            Err(MatchError::EmptyProbe)
        );
        assert_eq!(
            matcher.match_embedding(&[f32::NAN, 0.0], &candidates, 0.5),
            Err(MatchError::NonFinite)
        );
        assert_eq!(
            matcher.match_embedding(&[1.0, 0.0, 0.0], &candidates, 0.5),
            Err(MatchError::DimensionMismatch {
                probe: 3,
                expected: 2
            })
        );
    }

    #[test]
    fn test_mismatched_candidate_is_skipped() {
        let candidates: BTreeMap<_, _> = [
            enrolled(1, vec![1.0, 0.0, 0.0]),
            enrolled(2, vec![1.0, 0.0]),
        ]
        .into_iter()
        .collect();
        let result = FaceMatcher::default()
            .match_embedding(&[1.0, 0.0], &candidates, 0.5)
            .unwrap();
        assert_eq!(result.camper_id(), Some(CamperId(2)));
    }

    #[test]
    fn test_confidence_is_monotonic_in_distance() {
        let mut prev = distance_to_confidence(0.0);
        for step in 1..40 {
            let next = distance_to_confidence(step as f32 * 0.05);
            assert!(next < prev);
            prev = next;
        }
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("l2".parse::<DistanceMetric>(), Ok(DistanceMetric::Euclidean));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
