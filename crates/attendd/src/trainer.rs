//! Deep model lifecycle: the active artifact and (re)training.

use crate::error::ServiceError;
use crate::store::{FaceStore, StoredFace};
use attend_core::network::{fit, TrainReport};
use attend_core::{
    Embedding, Encoder, FaceCrop, FaceEncoder, ModelArtifact, TrainConfig, TrainError, TrainingExample, Variant,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock as AsyncRwLock};

/// The active model artifact. Readers clone the `Arc`; replacement swaps the
/// pointer, so a reader holds either the old artifact or the new one, whole.
#[derive(Default)]
pub struct ArtifactSlot {
    current: RwLock<Option<Arc<ModelArtifact>>>,
}

impl ArtifactSlot {
    pub fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Install a new artifact and return the one it replaced.
    pub fn swap(&self, artifact: Arc<ModelArtifact>) -> Option<Arc<ModelArtifact>> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.replace(artifact)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// A model exists and retraining was not forced.
    AlreadyTrained { version: String },
    Trained {
        version: String,
        users: usize,
        accuracy: f32,
        final_loss: f32,
        elapsed_ms: u128,
    },
}

impl TrainOutcome {
    pub fn version(&self) -> &str {
        match self {
            TrainOutcome::AlreadyTrained { version } | TrainOutcome::Trained { version, .. } => version,
        }
    }
}

/// Serialises training runs and publishes their artifacts.
pub struct ModelTrainer {
    store: FaceStore,
    slot: Arc<ArtifactSlot>,
    /// Held shared by registrations, exclusively while a new artifact is published.
    enrollment_gate: Arc<AsyncRwLock<()>>,
    training_gate: Mutex<()>,
    config: TrainConfig,
    timeout: Duration,
    model_path: PathBuf,
}

impl ModelTrainer {
    pub fn new(
        store: FaceStore,
        slot: Arc<ArtifactSlot>,
        enrollment_gate: Arc<AsyncRwLock<()>>,
        config: TrainConfig,
        timeout: Duration,
        model_path: PathBuf,
    ) -> Self {
        Self {
            store,
            slot,
            enrollment_gate,
            training_gate: Mutex::new(()),
            config,
            timeout,
            model_path,
        }
    }

    /// Load the persisted artifact, if any, and embed users that lack a deep
    /// embedding for it. An unreadable artifact is logged and skipped.
    pub async fn restore(&self) -> Result<(), ServiceError> {
        if !self.model_path.exists() {
            tracing::info!(path = %self.model_path.display(), "no trained model yet");
            return Ok(());
        }

        let path = self.model_path.clone();
        let artifact = match tokio::task::spawn_blocking(move || ModelArtifact::load(&path)).await? {
            Ok(artifact) => Arc::new(artifact),
            Err(e) => {
                tracing::warn!(path = %self.model_path.display(), error = %e, "ignoring unusable model artifact");
                return Ok(());
            }
        };

        let missing = self
            .store
            .users_missing_embedding(Variant::Deep, Some(&artifact.version))
            .await?;
        if !missing.is_empty() {
            let embeddings = embed_faces(artifact.clone(), missing).await?;
            self.store.insert_embeddings(embeddings).await?;
        }

        tracing::info!(
            version = %artifact.version,
            classes = artifact.classes.len(),
            trained_at = %artifact.trained_at,
            "deep model loaded"
        );
        self.slot.swap(artifact);
        Ok(())
    }

    /// Train unless a model exists and `force` is false.
    ///
    /// Concurrent callers wait for each other. On any failure the previously
    /// active artifact stays in place.
    pub async fn train(&self, force: bool) -> Result<TrainOutcome, ServiceError> {
        let _training = self.training_gate.lock().await;

        if !force {
            if let Some(current) = self.slot.current() {
                tracing::info!(version = %current.version, "model already trained; skipping");
                return Ok(TrainOutcome::AlreadyTrained {
                    version: current.version.clone(),
                });
            }
        }

        let faces = self.store.training_set().await?;
        let required = self.config.min_classes.max(2);
        if faces.len() < required {
            return Err(ServiceError::InsufficientUsers { found: faces.len() });
        }

        tracing::info!(users = faces.len(), force, "training deep model");
        let report = self.fit_with_timeout(faces).await?;
        let artifact = Arc::new(ModelArtifact::from_report(&report));

        let _publishing = self.enrollment_gate.write().await;

        // Users registered while fitting are included here.
        let faces = self.store.training_set().await?;
        let users = faces.len();
        let embeddings = embed_faces(artifact.clone(), faces).await?;
        self.store.insert_embeddings(embeddings).await?;

        let path = self.model_path.clone();
        let to_save = artifact.clone();
        tokio::task::spawn_blocking(move || to_save.save(&path))
            .await?
            .map_err(|e| ServiceError::TrainingFailed(format!("cannot persist model: {e}")))?;

        let previous = self.slot.swap(artifact.clone());
        let mut keep = vec![artifact.version.clone()];
        keep.extend(previous.map(|p| p.version.clone()));
        if let Err(e) = self.store.prune_deep_embeddings(keep).await {
            tracing::warn!(error = %e, "failed to prune old deep embeddings");
        }

        tracing::info!(
            version = %artifact.version,
            users,
            accuracy = report.accuracy,
            loss = report.final_loss,
            elapsed_ms = report.elapsed_ms as u64,
            "deep model trained"
        );

        Ok(TrainOutcome::Trained {
            version: artifact.version.clone(),
            users,
            accuracy: report.accuracy,
            final_loss: report.final_loss,
            elapsed_ms: report.elapsed_ms,
        })
    }

    async fn fit_with_timeout(&self, faces: Vec<StoredFace>) -> Result<TrainReport, ServiceError> {
        let config = self.config.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || -> Result<TrainReport, ServiceError> {
                let examples = faces
                    .into_iter()
                    .map(|face| -> Result<TrainingExample, ServiceError> {
                        let crop = FaceCrop::from_png(&face.crop_png).map_err(|e| {
                            ServiceError::TrainingFailed(format!("stored face of {} is unreadable: {e}", face.user_id))
                        })?;
                        Ok(TrainingExample {
                            user_id: face.user_id,
                            face: crop,
                        })
                    })
                    .collect::<Result<Vec<_>, ServiceError>>()?;
                fit(&examples, &config, &cancel).map_err(|e| match e {
                    TrainError::InsufficientUsers { found, .. } => ServiceError::InsufficientUsers { found },
                    other => ServiceError::TrainingFailed(other.to_string()),
                })
            }
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "training timed out; cancelling");
                Err(ServiceError::TrainingTimedOut(self.timeout))
            }
        }
    }
}

/// Deep embeddings for stored faces, computed on the blocking pool.
async fn embed_faces(
    artifact: Arc<ModelArtifact>,
    faces: Vec<StoredFace>,
) -> Result<Vec<(String, Embedding)>, ServiceError> {
    tokio::task::spawn_blocking(move || {
        let encoder = FaceEncoder::deep(artifact);
        faces
            .into_iter()
            .map(|face| -> Result<(String, Embedding), ServiceError> {
                let crop = FaceCrop::from_png(&face.crop_png).map_err(|e| {
                    ServiceError::TrainingFailed(format!("stored face of {} is unreadable: {e}", face.user_id))
                })?;
                let embedding = encoder
                    .encode(&crop)
                    .map_err(|e| ServiceError::TrainingFailed(e.to_string()))?;
                Ok((face.user_id, embedding))
            })
            .collect()
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Enrollment, UpsertOutcome};
    use attend_core::testing::{face_photo, FaceSpec};
    use attend_core::ClassicalEncoder;

    fn crop_png(pattern: u8) -> Vec<u8> {
        let rgb = face_photo(64, 64, &[FaceSpec { cx: 32, cy: 32, rx: 24, ry: 30, pattern }]);
        FaceCrop::from_pixels(image::DynamicImage::ImageRgb8(rgb).to_luma8())
            .to_png()
            .unwrap()
    }

    async fn enrol(store: &FaceStore, user_id: &str, pattern: u8) {
        let png = crop_png(pattern);
        let crop = FaceCrop::from_png(&png).unwrap();
        let outcome = store
            .upsert_user(
                Enrollment {
                    user_id: user_id.into(),
                    name: user_id.into(),
                    crop_png: png,
                    embeddings: vec![ClassicalEncoder.encode(&crop).unwrap()],
                },
                true,
            )
            .await
            .unwrap();
        assert_ne!(outcome, UpsertOutcome::Rejected);
    }

    async fn trainer(dir: &tempfile::TempDir, timeout: Duration) -> (FaceStore, Arc<ArtifactSlot>, ModelTrainer) {
        let store = FaceStore::open(&dir.path().join("attend.db")).await.unwrap();
        let slot = Arc::new(ArtifactSlot::default());
        let trainer = ModelTrainer::new(
            store.clone(),
            slot.clone(),
            Arc::new(AsyncRwLock::new(())),
            TrainConfig::default(),
            timeout,
            dir.path().join("deep_model.json"),
        );
        (store, slot, trainer)
    }

    #[tokio::test]
    async fn test_insufficient_users_has_no_side_effect() {
        let dir = tempfile::tempdir().unwrap();
        let (store, slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
        enrol(&store, "solo", 3).await;

        let result = trainer.train(true).await;
        assert!(matches!(result, Err(ServiceError::InsufficientUsers { found: 1 })));
        assert!(slot.current().is_none());
        assert!(!dir.path().join("deep_model.json").exists());
    }

    #[tokio::test]
    async fn test_train_then_idempotent_skip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
        enrol(&store, "a", 1).await;
        enrol(&store, "b", 6).await;

        let first = trainer.train(false).await.unwrap();
        assert!(matches!(first, TrainOutcome::Trained { users: 2, .. }));
        let version = first.version().to_string();
        assert_eq!(slot.current().unwrap().version, version);
        assert_eq!(store.gallery(Variant::Deep, Some(&version)).await.unwrap().len(), 2);
        assert!(dir.path().join("deep_model.json").exists());

        let second = trainer.train(false).await.unwrap();
        assert_eq!(second, TrainOutcome::AlreadyTrained { version: version.clone() });
        assert_eq!(slot.current().unwrap().version, version);
    }

    #[tokio::test]
    async fn test_forced_retrain_replaces_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
        enrol(&store, "a", 1).await;
        enrol(&store, "b", 6).await;

        let v1 = trainer.train(true).await.unwrap().version().to_string();
        let v2 = trainer.train(true).await.unwrap().version().to_string();
        let v3 = trainer.train(true).await.unwrap().version().to_string();
        assert_ne!(v1, v2);
        assert_eq!(slot.current().unwrap().version, v3);

        assert!(store.gallery(Variant::Deep, Some(&v1)).await.unwrap().is_empty());
        assert_eq!(store.gallery(Variant::Deep, Some(&v2)).await.unwrap().len(), 2);
        assert_eq!(store.gallery(Variant::Deep, Some(&v3)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_forced_training_serialises() {
        let dir = tempfile::tempdir().unwrap();
        let (store, slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
        enrol(&store, "a", 1).await;
        enrol(&store, "b", 6).await;
        enrol(&store, "c", 11).await;

        let trainer = Arc::new(trainer);
        let (first, second) = tokio::join!(trainer.train(true), trainer.train(true));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.version(), second.version());

        let active = slot.current().unwrap().version.clone();
        assert!(active == first.version() || active == second.version());
        let on_disk = ModelArtifact::load(&dir.path().join("deep_model.json")).unwrap();
        assert_eq!(on_disk.version, active);
    }

    #[tokio::test]
    async fn test_timeout_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (store, slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
        enrol(&store, "a", 1).await;
        enrol(&store, "b", 6).await;
        let v1 = trainer.train(true).await.unwrap().version().to_string();

        let slow = ModelTrainer::new(
            store.clone(),
            slot.clone(),
            Arc::new(AsyncRwLock::new(())),
            TrainConfig { epochs: 100_000, ..TrainConfig::default() },
            Duration::from_millis(50),
            dir.path().join("deep_model.json"),
        );
        let result = slow.train(true).await;
        assert!(matches!(result, Err(ServiceError::TrainingTimedOut(_))));
        assert_eq!(slot.current().unwrap().version, v1);
    }

    #[tokio::test]
    async fn test_restore_loads_and_backfills() {
        let dir = tempfile::tempdir().unwrap();
        let version = {
            let (store, _slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
            enrol(&store, "a", 1).await;
            enrol(&store, "b", 6).await;
            let version = trainer.train(true).await.unwrap().version().to_string();
            // Enrolled after training without a deep embedding.
            enrol(&store, "c", 11).await;
            version
        };

        let (store, slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
        trainer.restore().await.unwrap();
        assert_eq!(slot.current().unwrap().version, version);
        assert_eq!(store.gallery(Variant::Deep, Some(&version)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_restore_ignores_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deep_model.json"), b"{not json").unwrap();
        let (_store, slot, trainer) = trainer(&dir, Duration::from_secs(60)).await;
        trainer.restore().await.unwrap();
        assert!(slot.current().is_none());
    }
}
