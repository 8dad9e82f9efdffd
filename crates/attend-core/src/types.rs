use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// Which encoder produced an embedding. Embeddings of different variants
/// live in different spaces and are never compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Uniform LBP histograms, no training required.
    Classical,
    /// Hidden layer of the trained network.
    Deep,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Classical => "classical",
            Variant::Deep => "deep",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "classical" => Some(Variant::Classical),
            "deep" => Some(Variant::Deep),
            _ => None,
        }
    }

    /// Distance at which confidence reaches zero for this embedding space.
    pub fn distance_scale(&self) -> f32 {
        match self {
            Variant::Classical => CLASSICAL_DISTANCE_SCALE,
            Variant::Deep => DEEP_DISTANCE_SCALE,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Face embedding vector, L2-normalised by every encoder in this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub variant: Variant,
    /// Version of the model artifact that produced this embedding (deep variant only).
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn classical(values: Vec<f32>) -> Self {
        Self {
            values,
            variant: Variant::Classical,
            model_version: None,
        }
    }

    pub fn deep(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            variant: Variant::Deep,
            model_version: Some(model_version.into()),
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
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

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Same variant, same model version and same dimensionality.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        self.variant == other.variant
            && self.model_version == other.model_version
            && self.values.len() == other.values.len()
    }
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

/// Uniform-LBP descriptors are non-negative and clustered: distinct faces sit
/// roughly 0.03 to 0.2 apart, far inside the [0, 2] range of unit vectors.
pub const CLASSICAL_DISTANCE_SCALE: f32 = 0.1;
/// Hidden-layer embeddings spread over the full unit-vector range.
pub const DEEP_DISTANCE_SCALE: f32 = 2.0;

/// Map a distance to a confidence in [0, 1]: `1 - distance / scale`, clamped.
///
/// Distance 0 gives 1.0 and the mapping is strictly decreasing on [0, scale].
pub fn confidence_from_distance(distance: f32, scale: f32) -> f32 {
    if !distance.is_finite() || scale <= 0.0 {
        return 0.0;
    }
    (1.0 - distance / scale).clamp(0.0, 1.0)
}

/// One enrolled reference embedding together with the identity it belongs to.
#[derive(Debug, Clone)]
pub struct Reference {
    pub user_id: String,
    pub name: String,
    pub embedding: Embedding,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Confidence of the nearest reference, 0.0 when nothing was comparable.
    pub confidence: f32,
    /// Distance to the nearest reference, if any.
    pub distance: Option<f32>,
    pub user_id: Option<String>,
    pub name: Option<String>,
}

impl MatchResult {
    pub fn unmatched(confidence: f32, distance: Option<f32>) -> Self {
        Self {
            matched: false,
            confidence,
            distance,
            user_id: None,
            name: None,
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[Reference], threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Scans every comparable reference; exact ties keep the earliest entry, so the
/// gallery order (enrolment order) decides.
pub struct NearestMatcher;

impl Matcher for NearestMatcher {
    fn compare(&self, query: &Embedding, gallery: &[Reference], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        for (i, reference) in gallery.iter().enumerate() {
            if !query.is_comparable(&reference.embedding) {
                skipped += 1;
                continue;
            }
            let distance = query.euclidean_distance(&reference.embedding);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((i, distance)),
            }
        }

        if skipped > 0 {
            tracing::debug!(skipped, variant = %query.variant, "skipped incomparable references");
        }

        match best {
            Some((idx, distance)) => {
                let confidence = confidence_from_distance(distance, query.variant.distance_scale());
                if confidence >= threshold {
                    MatchResult {
                        matched: true,
                        confidence,
                        distance: Some(distance),
                        user_id: Some(gallery[idx].user_id.clone()),
                        name: Some(gallery[idx].name.clone()),
                    }
                } else {
                    MatchResult::unmatched(confidence, Some(distance))
                }
            }
            None => MatchResult::unmatched(0.0, None),
        }
    }
}
