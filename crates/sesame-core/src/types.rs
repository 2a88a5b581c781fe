use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face embedding vector (dimensionality fixed per deployment, e.g. 512 for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Extractor backend that produced this embedding (e.g., "facenet").
    pub model_name: Option<String>,
}

impl Embedding {
    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// A zero-magnitude operand yields 0.0 rather than NaN.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// One enrolled identity as synchronized from the enrollment authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    /// Unique, stable identifier assigned by the authority.
    pub identity_id: String,
    /// Human-readable label; not unique.
    pub display_name: String,
    pub embedding: Embedding,
    /// Last modification time on the authority, tie-breaker for equal revisions.
    pub updated_at: DateTime<Utc>,
    /// Monotonic per-identity counter; stale copies lose to higher revisions.
    pub revision: u64,
}

/// Result of matching a probe embedding against the enrolled set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Identity of the best match; present iff `matched`.
    pub identity_id: Option<String>,
    /// Display name of the best match; present iff `matched`.
    pub display_name: Option<String>,
    /// Cosine similarity of the best candidate [-1, 1]; 0.0 for an empty set.
    pub score: f32,
}

impl MatchResult {
    /// The no-candidates result (empty enrolled set).
    pub fn no_match() -> Self {
        Self {
            matched: false,
            identity_id: None,
            display_name: None,
            score: 0.0,
        }
    }
}
