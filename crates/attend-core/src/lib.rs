//! attend-core: face detection, encoding and matching for attendance tracking.
//!
//! Photos are decoded, searched for a single face, aligned to a 64×64 crop and
//! encoded either with uniform LBP histograms (classical) or with the hidden
//! layer of an identity network trained on the enrolled users (deep).

pub mod alignment;
pub mod artifact;
pub mod codec;
pub mod detector;
pub mod encoder;
pub mod lbp;
pub mod network;
pub mod pipeline;
#[cfg(feature = "onnx")]
pub mod scrfd;
pub mod skin;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use alignment::FaceCrop;
pub use artifact::{ArtifactError, ModelArtifact};
pub use detector::{DetectorError, FaceDetector};
pub use encoder::{ClassicalEncoder, DeepEncoder, EncodeError, Encoder, FaceEncoder};
pub use network::{TrainConfig, TrainError, TrainingExample};
pub use pipeline::{FacePipeline, PipelineError};
pub use skin::SkinRegionDetector;
pub use types::{BoundingBox, Embedding, MatchResult, Matcher, NearestMatcher, Reference, Variant};
