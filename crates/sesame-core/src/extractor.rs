//! Embedding extractor backends.
//!
//! The agent depends only on the [`EmbeddingExtractor`] capability and a
//! fixed per-deployment dimensionality; concrete backends are registered at
//! startup and selected by name from configuration.

use crate::types::Embedding;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: usize = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0; // fixed_image_standardization — NOT symmetric 127.5
const FACENET_EMBEDDING_DIM: usize = 512;

const HASHED_INPUT_SIZE: u32 = 64;
const HASHED_EMBEDDING_DIM: usize = 128;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    BadFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: turn a grayscale frame into a fixed-length embedding.
///
/// `Ok(None)` means the frame holds no usable face and should be skipped
/// without error. The shipped backends embed the whole frame and always
/// produce a vector; a detector-backed backend would return `None` here.
pub trait EmbeddingExtractor: Send {
    fn name(&self) -> &str;
    /// Dimensionality of every embedding this backend produces.
    fn embedding_dim(&self) -> usize;
    fn extract(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Embedding>, ExtractorError>;
}

/// Runtime-selectable backend registry. The first registered backend is the
/// default, used when configuration names an unknown backend.
#[derive(Default)]
pub struct ExtractorRegistry {
    backends: Vec<(String, Box<dyn EmbeddingExtractor>)>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Box<dyn EmbeddingExtractor>) {
        self.backends.push((backend.name().to_string(), backend));
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Remove and return the named backend, or fall back to the default
    /// (first registered) with a warning, matching the agent's startup
    /// behavior when configuration names a backend that failed to load.
    pub fn take_or_default(mut self, name: &str) -> Option<Box<dyn EmbeddingExtractor>> {
        if let Some(idx) = self.backends.iter().position(|(n, _)| n == name) {
            return Some(self.backends.remove(idx).1);
        }
        if !self.backends.is_empty() {
            tracing::warn!(
                requested = name,
                fallback = %self.backends[0].0,
                "extractor not registered, using default"
            );
            return Some(self.backends.remove(0).1);
        }
        None
    }
}

/// FaceNet-style recognizer via ONNX Runtime.
///
/// Expects a facenet-pytorch-compatible model: 3x160x160 input with
/// fixed_image_standardization, 512-dim output.
#[derive(Debug)]
pub struct OnnxExtractor {
    name: String,
    session: Session,
}

impl OnnxExtractor {
    pub fn load(name: &str, model_path: &str) -> Result<Self, ExtractorError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            backend = name,
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX extractor model"
        );

        Ok(Self { name: name.to_string(), session })
    }

    /// Resize a grayscale frame to 160x160 and build a standardized NCHW
    /// tensor, replicating the single channel to RGB.
    fn preprocess(gray: &[u8], width: u32, height: u32) -> Result<Array4<f32>, ExtractorError> {
        let expected = (width * height) as usize;
        if gray.len() < expected {
            return Err(ExtractorError::BadFrame { expected, actual: gray.len() });
        }

        let img = image::GrayImage::from_raw(width, height, gray[..expected].to_vec())
            .ok_or(ExtractorError::BadFrame { expected, actual: gray.len() })?;
        let resized = image::imageops::resize(
            &img,
            FACENET_INPUT_SIZE as u32,
            FACENET_INPUT_SIZE as u32,
            image::imageops::FilterType::Triangle,
        );

        let size = FACENET_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let pixel = resized.get_pixel(x as u32, y as u32)[0] as f32;
                let normalized = (pixel - FACENET_MEAN) / FACENET_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }
        Ok(tensor)
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_dim(&self) -> usize {
        FACENET_EMBEDDING_DIM
    }

    fn extract(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Embedding>, ExtractorError> {
        let input = Self::preprocess(gray, width, height)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize so cosine scores stay in the calibrated range.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Some(Embedding {
            values,
            model_name: Some(self.name.clone()),
        }))
    }
}

/// Deterministic, lightweight fallback backend.
///
/// Hashes a 64x64 downsample of the frame and cycles the digest bytes out
/// to 128 dimensions. Useless for real recognition, but it keeps the whole
/// pipeline exercisable on hardware with no model file installed.
pub struct HashedExtractor;

impl HashedExtractor {
    pub const NAME: &'static str = "hashed";
}

impl EmbeddingExtractor for HashedExtractor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn embedding_dim(&self) -> usize {
        HASHED_EMBEDDING_DIM
    }

    fn extract(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Embedding>, ExtractorError> {
        // Downsample first so sensor noise doesn't churn the digest.
        let normalized: Vec<u8> = match image::GrayImage::from_raw(
            width,
            height,
            gray.to_vec(),
        ) {
            Some(img) => image::imageops::resize(
                &img,
                HASHED_INPUT_SIZE,
                HASHED_INPUT_SIZE,
                image::imageops::FilterType::Triangle,
            )
            .into_raw(),
            None => gray.to_vec(),
        };

        let digest = Sha256::digest(&normalized);
        let floats: Vec<f32> = digest.iter().map(|&b| b as f32 / 255.0).collect();
        let values: Vec<f32> = floats
            .iter()
            .cycle()
            .take(HASHED_EMBEDDING_DIM)
            .copied()
            .collect();

        Ok(Some(Embedding {
            values,
            model_name: Some(Self::NAME.to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashed_is_deterministic() {
        let frame = vec![100u8; 64 * 64];
        let mut ex = HashedExtractor;
        let a = ex.extract(&frame, 64, 64).unwrap().unwrap();
        let b = ex.extract(&frame, 64, 64).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hashed_dimensionality() {
        let frame = vec![7u8; 32 * 32];
        let mut ex = HashedExtractor;
        let emb = ex.extract(&frame, 32, 32).unwrap().unwrap();
        assert_eq!(emb.dim(), HASHED_EMBEDDING_DIM);
        assert_eq!(emb.dim(), ex.embedding_dim());
        assert_eq!(emb.model_name.as_deref(), Some("hashed"));
    }

    #[test]
    fn test_hashed_distinguishes_frames() {
        let mut ex = HashedExtractor;
        let a = ex.extract(&vec![0u8; 64 * 64], 64, 64).unwrap().unwrap();
        let b = ex.extract(&vec![255u8; 64 * 64], 64, 64).unwrap().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hashed_values_in_unit_range() {
        let mut ex = HashedExtractor;
        let emb = ex.extract(&vec![42u8; 64 * 64], 64, 64).unwrap().unwrap();
        assert!(emb.values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_onnx_preprocess_shape_and_standardization() {
        let frame = vec![128u8; 160 * 160];
        let tensor = OnnxExtractor::preprocess(&frame, 160, 160).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE]);
        let expected = (128.0 - FACENET_MEAN) / FACENET_STD;
        let val = tensor[[0, 0, 0, 0]];
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_onnx_preprocess_replicates_channels() {
        let frame: Vec<u8> = (0..(160usize * 160)).map(|i| (i % 251) as u8).collect();
        let tensor = OnnxExtractor::preprocess(&frame, 160, 160).unwrap();
        for y in [0usize, 80, 159] {
            for x in [0usize, 80, 159] {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn test_onnx_preprocess_rejects_short_buffer() {
        let frame = vec![0u8; 10];
        assert!(matches!(
            OnnxExtractor::preprocess(&frame, 160, 160),
            Err(ExtractorError::BadFrame { .. })
        ));
    }

    #[test]
    fn test_onnx_load_missing_model() {
        let err = OnnxExtractor::load("facenet", "/nonexistent/model.onnx").unwrap_err();
        assert!(matches!(err, ExtractorError::ModelNotFound(_)));
    }

    #[test]
    fn test_registry_takes_named_backend() {
        let mut reg = ExtractorRegistry::new();
        reg.register(Box::new(HashedExtractor));
        let backend = reg.take_or_default("hashed").unwrap();
        assert_eq!(backend.name(), "hashed");
    }

    #[test]
    fn test_registry_falls_back_to_default() {
        let mut reg = ExtractorRegistry::new();
        reg.register(Box::new(HashedExtractor));
        let backend = reg.take_or_default("facenet").unwrap();
        assert_eq!(backend.name(), "hashed");
    }

    #[test]
    fn test_registry_empty_yields_none() {
        let reg = ExtractorRegistry::new();
        assert!(reg.take_or_default("anything").is_none());
    }
}
