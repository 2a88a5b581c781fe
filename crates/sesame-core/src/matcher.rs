//! Similarity matching against the enrolled set.
//!
//! Pure and side-effect free; the daemon hands it a cache snapshot and a
//! probe embedding, nothing else.

use crate::types::{Embedding, EnrollmentRecord, MatchResult};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("embedding dimension mismatch: probe has {probe}, enrolled set has {enrolled}")]
    DimensionMismatch { probe: usize, enrolled: usize },
}

/// Strategy for comparing a probe embedding against enrolled records.
///
/// Cosine is the default metric and the one all documented thresholds are
/// calibrated against; alternative metrics plug in behind this trait.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        enrolled: &[EnrollmentRecord],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine-similarity matcher.
///
/// Scans every enrolled record (no early exit), declares a match only when
/// the best score strictly exceeds the threshold, and resolves exact score
/// ties to the lexicographically smallest `identity_id` so the outcome never
/// depends on iteration order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        enrolled: &[EnrollmentRecord],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let Some(first) = enrolled.first() else {
            return Ok(MatchResult::no_match());
        };

        // The cache enforces one dimensionality across all records, so the
        // first record speaks for the set.
        let enrolled_dim = first.embedding.dim();
        if probe.dim() != enrolled_dim {
            return Err(MatchError::DimensionMismatch {
                probe: probe.dim(),
                enrolled: enrolled_dim,
            });
        }

        let mut best: &EnrollmentRecord = first;
        let mut best_score = f32::NEG_INFINITY;

        for record in enrolled {
            let score = probe.similarity(&record.embedding);
            let wins = score > best_score
                || (score == best_score && record.identity_id < best.identity_id);
            if wins {
                best_score = score;
                best = record;
            }
        }

        if best_score > threshold {
            Ok(MatchResult {
                matched: true,
                identity_id: Some(best.identity_id.clone()),
                display_name: Some(best.display_name.clone()),
                score: best_score,
            })
        } else {
            Ok(MatchResult {
                matched: false,
                identity_id: None,
                display_name: None,
                score: best_score,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, values: Vec<f32>) -> EnrollmentRecord {
        EnrollmentRecord {
            identity_id: id.to_string(),
            display_name: id.to_uppercase(),
            embedding: Embedding { values, model_name: None },
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            revision: 1,
        }
    }

    fn probe(values: Vec<f32>) -> Embedding {
        Embedding { values, model_name: None }
    }

    #[test]
    fn test_empty_set_is_no_match() {
        let result = CosineMatcher.compare(&probe(vec![1.0, 0.0]), &[], 0.6).unwrap();
        assert!(!result.matched);
        assert_eq!(result.identity_id, None);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_best_of_many() {
        let enrolled = vec![
            record("carol", vec![0.0, 1.0, 0.0]),
            record("dave", vec![0.0, 0.0, 1.0]),
            record("erin", vec![1.0, 0.0, 0.0]),
        ];
        let result = CosineMatcher
            .compare(&probe(vec![1.0, 0.0, 0.0]), &enrolled, 0.5)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.identity_id.as_deref(), Some("erin"));
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        // Orthogonal-ish vectors engineered so the score lands exactly on
        // the threshold: identical vectors score exactly 1.0.
        let enrolled = vec![record("frank", vec![1.0, 0.0])];
        let result = CosineMatcher
            .compare(&probe(vec![1.0, 0.0]), &enrolled, 1.0)
            .unwrap();
        assert!(!result.matched, "score == threshold must not match");
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tie_breaks_to_smallest_identity_id() {
        // Two records with identical embeddings produce the exact same
        // score; "alice" < "bob" must win regardless of insertion order.
        let enrolled = vec![
            record("bob", vec![0.91, 0.1]),
            record("alice", vec![0.91, 0.1]),
        ];
        let result = CosineMatcher
            .compare(&probe(vec![0.91, 0.1]), &enrolled, 0.6)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.identity_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_deterministic_across_calls() {
        let enrolled = vec![
            record("bob", vec![1.0, 0.0]),
            record("alice", vec![1.0, 0.0]),
            record("carol", vec![0.0, 1.0]),
        ];
        let q = probe(vec![1.0, 0.0]);
        let first = CosineMatcher.compare(&q, &enrolled, 0.6).unwrap();
        for _ in 0..10 {
            assert_eq!(CosineMatcher.compare(&q, &enrolled, 0.6).unwrap(), first);
        }
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let enrolled = vec![record("grace", vec![1.0, 0.0, 0.0])];
        let err = CosineMatcher
            .compare(&probe(vec![1.0, 0.0]), &enrolled, 0.6)
            .unwrap_err();
        match err {
            MatchError::DimensionMismatch { probe, enrolled } => {
                assert_eq!(probe, 2);
                assert_eq!(enrolled, 3);
            }
        }
    }

    #[test]
    fn test_below_threshold_reports_score() {
        let enrolled = vec![record("heidi", vec![0.0, 1.0])];
        let result = CosineMatcher
            .compare(&probe(vec![1.0, 0.0]), &enrolled, 0.6)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.identity_id, None);
        assert!(result.score.abs() < 1e-6);
    }
}
