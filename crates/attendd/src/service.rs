//! Registration, recognition and the read-only queries behind the API.

use crate::config::Config;
use crate::error::ServiceError;
use crate::ledger::{AttendanceLedger, AttendanceRecord};
use crate::store::{Enrollment, FaceStore, UpsertOutcome, UserRecord};
use crate::trainer::{ArtifactSlot, ModelTrainer, TrainOutcome};
use attend_core::{ClassicalEncoder, Encoder, FaceDetector, FaceEncoder, FacePipeline, Matcher, NearestMatcher};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user_id: String,
    pub name: String,
    /// An existing user with this id was overwritten.
    pub replaced: bool,
}

#[derive(Debug, Clone)]
pub enum Recognition {
    Recognized {
        user_id: String,
        name: String,
        confidence: f32,
        record: AttendanceRecord,
    },
    /// Nobody was close enough. Not an error.
    Unrecognized,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub version: &'static str,
    pub detector: &'static str,
    pub model_loaded: bool,
    pub model_version: Option<String>,
    pub users: usize,
    pub records: usize,
}

/// Shared state for all request handlers.
pub struct Engine {
    pipeline: FacePipeline,
    store: FaceStore,
    ledger: AttendanceLedger,
    slot: Arc<ArtifactSlot>,
    trainer: ModelTrainer,
    enrollment_gate: Arc<RwLock<()>>,
    classical_threshold: f32,
    deep_threshold: f32,
    allow_reregistration: bool,
}

impl Engine {
    /// Open storage, restore the persisted model and wire everything together.
    pub async fn open(config: &Config, detector: Arc<dyn FaceDetector>) -> Result<Self, ServiceError> {
        let store = FaceStore::open(&config.db_path).await?;
        let ledger = AttendanceLedger::open(&config.db_path).await?;
        let slot = Arc::new(ArtifactSlot::default());
        let enrollment_gate = Arc::new(RwLock::new(()));

        let trainer = ModelTrainer::new(
            store.clone(),
            slot.clone(),
            enrollment_gate.clone(),
            config.train.clone(),
            config.train_timeout,
            config.model_path.clone(),
        );
        trainer.restore().await?;

        Ok(Self {
            pipeline: FacePipeline::new(detector, config.ambiguity_ratio, config.max_image_dimension),
            store,
            ledger,
            slot,
            trainer,
            enrollment_gate,
            classical_threshold: config.classical_threshold,
            deep_threshold: config.deep_threshold,
            allow_reregistration: config.allow_reregistration,
        })
    }

    /// Enrol a user from one photo, computing every embedding variant available now.
    pub async fn register(&self, user_id: &str, name: &str, image: Vec<u8>) -> Result<Registration, ServiceError> {
        let user_id = user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(ServiceError::InvalidRequest("Missing file or userId".into()));
        }
        let name = match name.trim() {
            "" => user_id.clone(),
            trimmed => trimmed.to_string(),
        };

        let _enrolling = self.enrollment_gate.read().await;
        let artifact = self.slot.current();
        let pipeline = self.pipeline.clone();

        let (crop_png, embeddings) = tokio::task::spawn_blocking(move || -> Result<_, ServiceError> {
            let crop = pipeline.extract(&image)?;
            let mut embeddings = vec![ClassicalEncoder
                .encode(&crop)
                .map_err(|e| ServiceError::Internal(e.to_string()))?];
            if let Some(artifact) = artifact {
                embeddings.push(
                    FaceEncoder::deep(artifact)
                        .encode(&crop)
                        .map_err(|e| ServiceError::Internal(e.to_string()))?,
                );
            }
            let png = crop.to_png().map_err(|e| ServiceError::Internal(e.to_string()))?;
            Ok((png, embeddings))
        })
        .await??;

        let variants = embeddings.len();
        let outcome = self
            .store
            .upsert_user(
                Enrollment {
                    user_id: user_id.clone(),
                    name: name.clone(),
                    crop_png,
                    embeddings,
                },
                self.allow_reregistration,
            )
            .await?;

        let replaced = match outcome {
            UpsertOutcome::Rejected => return Err(ServiceError::DuplicateUserId(user_id)),
            UpsertOutcome::Created => false,
            UpsertOutcome::Replaced => true,
        };
        tracing::info!(user_id = %user_id, name = %name, replaced, variants, "user registered");

        Ok(Registration { user_id, name, replaced })
    }

    /// Identify the face in `image`; on a match, append an attendance record.
    pub async fn recognize(&self, image: Vec<u8>, use_deep: bool) -> Result<Recognition, ServiceError> {
        let (encoder, threshold) = if use_deep {
            let artifact = self.slot.current().ok_or(ServiceError::ModelNotTrained)?;
            (FaceEncoder::deep(artifact), self.deep_threshold)
        } else {
            (FaceEncoder::classical(), self.classical_threshold)
        };
        let variant = encoder.variant();
        let model_version = encoder.model_version().map(str::to_string);

        let pipeline = self.pipeline.clone();
        let query = tokio::task::spawn_blocking(move || -> Result<_, ServiceError> {
            let crop = pipeline.extract(&image)?;
            encoder
                .encode(&crop)
                .map_err(|e| ServiceError::Internal(e.to_string()))
        })
        .await??;

        let gallery = self.store.gallery(variant, model_version.as_deref()).await?;
        let result = NearestMatcher.compare(&query, &gallery, threshold);

        let (Some(user_id), Some(name)) = (result.user_id, result.name) else {
            tracing::info!(
                variant = %variant,
                gallery = gallery.len(),
                best_confidence = result.confidence,
                "face not recognized"
            );
            return Ok(Recognition::Unrecognized);
        };

        let record = self
            .ledger
            .append(&user_id, &name, result.confidence)
            .await
            .map_err(|e| {
                tracing::error!(user_id = %user_id, error = %e, "attendance write failed");
                ServiceError::LedgerWriteFailed(e.to_string())
            })?;

        tracing::info!(
            user_id = %user_id,
            variant = %variant,
            confidence = result.confidence,
            "attendance recorded"
        );
        Ok(Recognition::Recognized {
            user_id,
            name,
            confidence: result.confidence,
            record,
        })
    }

    pub async fn train(&self, force: bool) -> Result<TrainOutcome, ServiceError> {
        self.trainer.train(force).await
    }

    pub async fn attendance(&self) -> Result<Vec<AttendanceRecord>, ServiceError> {
        Ok(self.ledger.list_all().await?)
    }

    pub async fn users(&self) -> Result<Vec<UserRecord>, ServiceError> {
        Ok(self.store.list_users().await?)
    }

    pub async fn status(&self) -> Result<Status, ServiceError> {
        let artifact = self.slot.current();
        Ok(Status {
            version: env!("CARGO_PKG_VERSION"),
            detector: self.pipeline.detector_name(),
            model_loaded: artifact.is_some(),
            model_version: artifact.map(|a| a.version.clone()),
            users: self.store.count_users().await?,
            records: self.ledger.count().await?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FileConfig;
    use attend_core::testing::{png_photo, FaceSpec};
    use attend_core::SkinRegionDetector;

    pub(crate) async fn engine_with(dir: &tempfile::TempDir, overrides: &[(&str, &str)]) -> Engine {
        let mut vars: Vec<(String, String)> = vec![(
            "ATTEND_DATA_DIR".into(),
            dir.path().to_string_lossy().into_owned(),
        )];
        vars.extend(overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let config = Config::resolve(FileConfig::default(), move |key| {
            vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        Engine::open(&config, Arc::new(SkinRegionDetector::default()))
            .await
            .unwrap()
    }

    pub(crate) fn photo(pattern: u8) -> Vec<u8> {
        png_photo(&[FaceSpec::centred(80, 80, pattern)])
    }

    /// Make every later attendance append fail, through a separate connection.
    pub(crate) fn break_ledger(dir: &tempfile::TempDir) {
        let conn = rusqlite::Connection::open(dir.path().join("attend.db")).unwrap();
        conn.execute_batch("DROP TABLE attendance").unwrap();
    }

    #[tokio::test]
    async fn test_register_then_recognize_same_photo() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;

        let registration = engine.register("u1", "Alice", photo(1)).await.unwrap();
        assert_eq!(registration.name, "Alice");
        assert!(!registration.replaced);

        match engine.recognize(photo(1), false).await.unwrap() {
            Recognition::Recognized { user_id, name, confidence, record } => {
                assert_eq!(user_id, "u1");
                assert_eq!(name, "Alice");
                assert!(confidence >= 0.9, "confidence = {confidence}");
                assert_eq!(record.user_id, "u1");
            }
            other => panic!("expected a match, got {other:?}"),
        }
        assert_eq!(engine.attendance().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nearest_user_wins() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        engine.register("u2", "Bob", photo(9)).await.unwrap();

        let Recognition::Recognized { user_id, .. } = engine.recognize(photo(9), false).await.unwrap() else {
            panic!("expected a match");
        };
        assert_eq!(user_id, "u2");
    }

    #[tokio::test]
    async fn test_unenrolled_faces_not_recognized_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();

        for pattern in 2..16 {
            let result = engine.recognize(photo(pattern), false).await.unwrap();
            assert!(
                matches!(result, Recognition::Unrecognized),
                "pattern {pattern} was attributed to an enrolled user: {result:?}"
            );
        }
        assert!(engine.attendance().await.unwrap().is_empty());

        // The enrolled face itself is still accepted.
        assert!(matches!(
            engine.recognize(photo(1), false).await.unwrap(),
            Recognition::Recognized { .. }
        ));
    }

    #[tokio::test]
    async fn test_recognize_with_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        let result = engine.recognize(photo(1), false).await.unwrap();
        assert!(matches!(result, Recognition::Unrecognized));
    }

    #[tokio::test]
    async fn test_no_face_mutates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        let blank = png_photo(&[]);

        assert!(matches!(
            engine.register("u1", "Alice", blank.clone()).await,
            Err(ServiceError::NoFaceDetected)
        ));
        assert!(matches!(
            engine.recognize(blank, false).await,
            Err(ServiceError::NoFaceDetected)
        ));
        assert!(engine.users().await.unwrap().is_empty());
        assert!(engine.attendance().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multiple_faces_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        let rgb = attend_core::testing::face_photo(
            320,
            160,
            &[FaceSpec::centred(80, 80, 1), FaceSpec::centred(240, 80, 2)],
        );
        let bytes = attend_core::testing::encode(&rgb, image::ImageFormat::Png);
        assert!(matches!(
            engine.register("u1", "Alice", bytes).await,
            Err(ServiceError::MultipleFaces(2))
        ));
    }

    #[tokio::test]
    async fn test_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        let err = engine.register("u1", "Alice", b"GIF89a....".to_vec()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
        assert!(err.to_string().starts_with("Failed to read image"));
    }

    #[tokio::test]
    async fn test_register_validates_fields() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        assert!(matches!(
            engine.register("   ", "Alice", photo(1)).await,
            Err(ServiceError::InvalidRequest(_))
        ));

        let registration = engine.register(" u7 ", "  ", photo(1)).await.unwrap();
        assert_eq!(registration.user_id, "u7");
        assert_eq!(registration.name, "u7");
    }

    #[tokio::test]
    async fn test_reregistration_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        let again = engine.register("u1", "Alicia", photo(5)).await.unwrap();
        assert!(again.replaced);

        let users = engine.users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Alicia");
    }

    #[tokio::test]
    async fn test_reregistration_rejected_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[("ATTEND_ALLOW_REREGISTRATION", "false")]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        let err = engine.register("u1", "Mallory", photo(5)).await.unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateUserId(ref id) if id == "u1"));
        assert_eq!(engine.users().await.unwrap()[0].name, "Alice");
    }

    #[tokio::test]
    async fn test_deep_requires_trained_model() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        assert!(matches!(
            engine.recognize(photo(1), true).await,
            Err(ServiceError::ModelNotTrained)
        ));
    }

    #[tokio::test]
    async fn test_deep_recognition_after_training() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        engine.register("u2", "Bob", photo(9)).await.unwrap();

        let outcome = engine.train(false).await.unwrap();
        assert!(matches!(outcome, TrainOutcome::Trained { users: 2, .. }));

        // Registered after training: gets a deep embedding straight away.
        engine.register("u3", "Carol", photo(13)).await.unwrap();

        for (user, pattern) in [("u1", 1), ("u3", 13)] {
            let Recognition::Recognized { user_id, confidence, .. } =
                engine.recognize(photo(pattern), true).await.unwrap()
            else {
                panic!("expected a deep match for {user}");
            };
            assert_eq!(user_id, user);
            assert!(confidence >= 0.9);
        }

        let status = engine.status().await.unwrap();
        assert!(status.model_loaded);
        assert_eq!(status.model_version.as_deref(), Some(outcome.version()));
        assert_eq!(status.users, 3);
        assert_eq!(status.records, 2);
    }

    #[tokio::test]
    async fn test_train_needs_two_users() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        let err = engine.train(true).await.unwrap_err();
        assert_eq!(err.to_string(), "Need at least 2 users to train the model (found 1)");
    }

    #[tokio::test]
    async fn test_ledger_grows_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        engine.register("u2", "Bob", photo(9)).await.unwrap();

        for pattern in [1, 9, 1] {
            engine.recognize(photo(pattern), false).await.unwrap();
        }
        let records = engine.attendance().await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2", "u1"]);
        assert!(records.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_ledger_failure_after_match_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        break_ledger(&dir);

        let err = engine.recognize(photo(1), false).await.unwrap_err();
        assert!(matches!(err, ServiceError::LedgerWriteFailed(_)), "got {err:?}");
        assert!(err
            .to_string()
            .starts_with("Face recognized but attendance could not be recorded"));

        // A non-match never touches the ledger, so it still succeeds.
        let result = engine.recognize(photo(14), false).await.unwrap();
        assert!(matches!(result, Recognition::Unrecognized));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[]).await;
        engine.register("u1", "Alice", photo(1)).await.unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.detector, "skin");
        assert!(!status.model_loaded);
        assert_eq!(status.users, 1);
        assert_eq!(status.records, 0);
    }
}
