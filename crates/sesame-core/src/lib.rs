//! sesame-core — embedding types, similarity matching, extractor backends.
//!
//! Pure matching logic plus the pluggable embedding-extractor capability.
//! Nothing here touches hardware, the network, or shared state, so every
//! decision the matcher makes is directly unit-testable.

pub mod extractor;
pub mod matcher;
pub mod types;

pub use extractor::{
    EmbeddingExtractor, ExtractorError, ExtractorRegistry, HashedExtractor, OnnxExtractor,
};
pub use matcher::{CosineMatcher, MatchError, Matcher};
pub use types::{Embedding, EnrollmentRecord, MatchResult};
