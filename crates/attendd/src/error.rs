use crate::store::StoreError;
use attend_core::PipelineError;
use std::time::Duration;
use thiserror::Error;

/// Every failure a request can end in. Messages are shown to users verbatim.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Failed to read image: {0}")]
    Decode(String),
    #[error("No face detected in the image")]
    NoFaceDetected,
    #[error("Multiple faces detected ({0}); please upload a photo with a single face")]
    MultipleFaces(usize),
    #[error("User {0} is already registered")]
    DuplicateUserId(String),
    #[error("Need at least 2 users to train the model (found {found})")]
    InsufficientUsers { found: usize },
    #[error("Deep learning model has not been trained yet; train the model or use classical recognition")]
    ModelNotTrained,
    #[error("Training timed out after {}s", .0.as_secs())]
    TrainingTimedOut(Duration),
    #[error("Training failed: {0}")]
    TrainingFailed(String),
    #[error("Face recognized but attendance could not be recorded: {0}")]
    LedgerWriteFailed(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PipelineError> for ServiceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Decode(e) => ServiceError::Decode(e.to_string()),
            PipelineError::NoFaceDetected => ServiceError::NoFaceDetected,
            PipelineError::MultipleFaces(n) => ServiceError::MultipleFaces(n),
            PipelineError::Detector(e) => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServiceError::Internal(format!("worker task failed: {err}"))
    }
}
