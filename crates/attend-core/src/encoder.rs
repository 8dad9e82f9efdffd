//! Face crop → embedding.

use crate::alignment::FaceCrop;
use crate::artifact::ModelArtifact;
use crate::lbp::lbp_features;
use crate::types::{l2_normalize, Embedding, Variant};
use ndarray::Array2;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("feature dimension {found} does not match model input {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("feature shape: {0}")]
    Shape(String),
}

/// Turns an aligned face crop into an embedding of one [`Variant`].
pub trait Encoder {
    fn variant(&self) -> Variant;
    fn encode(&self, face: &FaceCrop) -> Result<Embedding, EncodeError>;
}

/// Uniform-LBP descriptor. Needs no training.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicalEncoder;

impl Encoder for ClassicalEncoder {
    fn variant(&self) -> Variant {
        Variant::Classical
    }

    fn encode(&self, face: &FaceCrop) -> Result<Embedding, EncodeError> {
        Ok(Embedding::classical(lbp_features(&face.pixels)))
    }
}

/// Hidden layer of a trained identity network, tagged with the artifact version.
#[derive(Debug, Clone)]
pub struct DeepEncoder {
    artifact: Arc<ModelArtifact>,
}

impl DeepEncoder {
    pub fn new(artifact: Arc<ModelArtifact>) -> Self {
        Self { artifact }
    }
}

impl Encoder for DeepEncoder {
    fn variant(&self) -> Variant {
        Variant::Deep
    }

    fn encode(&self, face: &FaceCrop) -> Result<Embedding, EncodeError> {
        let features = lbp_features(&face.pixels);
        let expected = self.artifact.input_dim();
        if features.len() != expected {
            return Err(EncodeError::DimensionMismatch {
                expected,
                found: features.len(),
            });
        }

        let input = Array2::from_shape_vec((1, features.len()), features)
            .map_err(|e| EncodeError::Shape(e.to_string()))?;
        let mut values: Vec<f32> = self.artifact.network.hidden(&input).iter().copied().collect();
        l2_normalize(&mut values);
        Ok(Embedding::deep(values, self.artifact.version.clone()))
    }
}

/// Either encoder, chosen per request.
#[derive(Debug, Clone)]
pub enum FaceEncoder {
    Classical(ClassicalEncoder),
    Deep(DeepEncoder),
}

impl FaceEncoder {
    pub fn classical() -> Self {
        FaceEncoder::Classical(ClassicalEncoder)
    }

    pub fn deep(artifact: Arc<ModelArtifact>) -> Self {
        FaceEncoder::Deep(DeepEncoder::new(artifact))
    }

    /// Artifact version for the deep variant.
    pub fn model_version(&self) -> Option<&str> {
        match self {
            FaceEncoder::Classical(_) => None,
            FaceEncoder::Deep(deep) => Some(deep.artifact.version.as_str()),
        }
    }
}

impl Encoder for FaceEncoder {
    fn variant(&self) -> Variant {
        match self {
            FaceEncoder::Classical(e) => e.variant(),
            FaceEncoder::Deep(e) => e.variant(),
        }
    }

    fn encode(&self, face: &FaceCrop) -> Result<Embedding, EncodeError> {
        match self {
            FaceEncoder::Classical(e) => e.encode(face),
            FaceEncoder::Deep(e) => e.encode(face),
        }
    }
}
