//! Trained model artifact: network weights plus identifying metadata.
//!
//! Persisted as JSON. The file is written next to its destination and renamed
//! into place, so a reader sees either the old or the new artifact. A SHA-256
//! digest over the weights is checked on load.

use crate::network::{Network, TrainReport};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact digest mismatch (expected {expected}, computed {computed})")]
    DigestMismatch { expected: String, computed: String },
    #[error("artifact weights have inconsistent shape: {0}")]
    Shape(String),
}

/// A trained identity network and the users it was trained on.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    /// Unique per training run (UUID v4).
    pub version: String,
    pub trained_at: DateTime<Utc>,
    /// User ids in class-index order.
    pub classes: Vec<String>,
    pub final_loss: f32,
    pub accuracy: f32,
    pub samples: usize,
    pub network: Network,
    /// Hex SHA-256 over the weights.
    pub digest: String,
}

/// On-disk layout: matrices flattened in row-major order.
#[derive(Serialize, Deserialize)]
struct StoredArtifact {
    version: String,
    trained_at: DateTime<Utc>,
    classes: Vec<String>,
    final_loss: f32,
    accuracy: f32,
    samples: usize,
    input_dim: usize,
    hidden_dim: usize,
    mean: Vec<f32>,
    scale: Vec<f32>,
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: Vec<f32>,
    digest: String,
}

impl ModelArtifact {
    pub fn from_report(report: &TrainReport) -> Self {
        let network = report.network.clone();
        Self {
            version: uuid::Uuid::new_v4().to_string(),
            trained_at: Utc::now(),
            classes: report.classes.clone(),
            final_loss: report.final_loss,
            accuracy: report.accuracy,
            samples: report.samples,
            digest: weights_digest(&network),
            network,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.network.input_dim()
    }

    pub fn hidden_dim(&self) -> usize {
        self.network.hidden_dim()
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(&self.to_stored())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), version = %self.version, "model artifact saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = std::fs::read(path)?;
        let stored: StoredArtifact = serde_json::from_slice(&bytes)?;
        Self::from_stored(stored)
    }

    fn to_stored(&self) -> StoredArtifact {
        let n = &self.network;
        StoredArtifact {
            version: self.version.clone(),
            trained_at: self.trained_at,
            classes: self.classes.clone(),
            final_loss: self.final_loss,
            accuracy: self.accuracy,
            samples: self.samples,
            input_dim: n.input_dim(),
            hidden_dim: n.hidden_dim(),
            mean: n.mean.to_vec(),
            scale: n.scale.to_vec(),
            w1: n.w1.iter().copied().collect(),
            b1: n.b1.to_vec(),
            w2: n.w2.iter().copied().collect(),
            b2: n.b2.to_vec(),
            digest: self.digest.clone(),
        }
    }

    fn from_stored(stored: StoredArtifact) -> Result<Self, ArtifactError> {
        let (input, hidden, classes) = (stored.input_dim, stored.hidden_dim, stored.classes.len());
        let shape_err = |e: ndarray::ShapeError| ArtifactError::Shape(e.to_string());

        let vector = |name: &str, values: Vec<f32>, len: usize| {
            if values.len() == len {
                Ok(Array1::from_vec(values))
            } else {
                Err(ArtifactError::Shape(format!("{name} has {} values, expected {len}", values.len())))
            }
        };

        let network = Network {
            mean: vector("mean", stored.mean, input)?,
            scale: vector("scale", stored.scale, input)?,
            w1: Array2::from_shape_vec((hidden, input), stored.w1).map_err(shape_err)?,
            b1: vector("b1", stored.b1, hidden)?,
            w2: Array2::from_shape_vec((classes, hidden), stored.w2).map_err(shape_err)?,
            b2: vector("b2", stored.b2, classes)?,
        };

        let computed = weights_digest(&network);
        if computed != stored.digest {
            return Err(ArtifactError::DigestMismatch {
                expected: stored.digest,
                computed,
            });
        }

        Ok(Self {
            version: stored.version,
            trained_at: stored.trained_at,
            classes: stored.classes,
            final_loss: stored.final_loss,
            accuracy: stored.accuracy,
            samples: stored.samples,
            network,
            digest: computed,
        })
    }
}

fn weights_digest(network: &Network) -> String {
    let mut hasher = Sha256::new();
    for dim in [network.input_dim(), network.hidden_dim(), network.classes()] {
        hasher.update((dim as u64).to_le_bytes());
    }
    let values = network
        .mean
        .iter()
        .chain(network.scale.iter())
        .chain(network.w1.iter())
        .chain(network.b1.iter())
        .chain(network.w2.iter())
        .chain(network.b2.iter());
    for value in values {
        hasher.update(value.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}
