//! HTTP API.

use crate::error::ServiceError;
use crate::service::{Engine, Recognition};
use crate::trainer::TrainOutcome;
use axum::body::Bytes;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::InvalidRequest(_)
            | ServiceError::Decode(_)
            | ServiceError::NoFaceDetected
            | ServiceError::MultipleFaces(_)
            | ServiceError::InsufficientUsers { .. } => StatusCode::BAD_REQUEST,
            ServiceError::DuplicateUserId(_) | ServiceError::ModelNotTrained => StatusCode::CONFLICT,
            ServiceError::TrainingTimedOut(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::TrainingFailed(_)
            | ServiceError::LedgerWriteFailed(_)
            | ServiceError::Storage(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(serde_json::json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

/// Build the router. Every endpoint is served both at the root and under `/api`.
pub fn router(engine: Arc<Engine>, max_upload_bytes: usize) -> Router {
    let api = Router::new()
        .route("/register", post(register))
        .route("/recognize", post(recognize))
        .route("/attendance", get(attendance))
        .route("/users", get(users))
        .route("/train-model", post(train_model))
        .route("/status", get(status))
        .route("/health", get(|| async { "OK" }));

    Router::new()
        .nest("/api", api.clone())
        .merge(api)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Text fields and the `file` part of a multipart upload.
#[derive(Default)]
struct Upload {
    fields: HashMap<String, String>,
    file: Option<Vec<u8>>,
}

impl Upload {
    async fn read(multipart: Result<Multipart, MultipartRejection>) -> Result<Self, ServiceError> {
        let mut multipart = multipart.map_err(|rejection| {
            ServiceError::InvalidRequest(format!("Malformed upload: {}", rejection.body_text()))
        })?;
        let mut upload = Upload::default();
        while let Some(field) = multipart.next_field().await.map_err(malformed)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == "file" {
                let bytes = field.bytes().await.map_err(malformed)?;
                upload.file = Some(bytes.to_vec());
            } else {
                let text = field.text().await.map_err(malformed)?;
                upload.fields.insert(name, text);
            }
        }
        Ok(upload)
    }

    fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or_default()
    }

    /// The uploaded image, if present and non-empty.
    fn take_file(&mut self) -> Option<Vec<u8>> {
        self.file.take().filter(|bytes| !bytes.is_empty())
    }
}

fn malformed(err: MultipartError) -> ServiceError {
    ServiceError::InvalidRequest(format!("Malformed upload: {}", err.body_text()))
}

async fn register(
    State(engine): State<Arc<Engine>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ServiceError> {
    let mut upload = Upload::read(multipart).await?;
    let user_id = upload.field("userId").trim().to_string();
    let image = match upload.take_file() {
        Some(image) if !user_id.is_empty() => image,
        _ => return Err(ServiceError::InvalidRequest("Missing file or userId".into())),
    };

    let registration = engine.register(&user_id, upload.field("name"), image).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("User {} registered successfully", registration.name),
        "userId": registration.user_id,
        "name": registration.name,
        "replaced": registration.replaced,
    }))
    .into_response())
}

async fn recognize(
    State(engine): State<Arc<Engine>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ServiceError> {
    let mut upload = Upload::read(multipart).await?;
    let use_deep = upload.field("useDeepLearning").trim().eq_ignore_ascii_case("true");
    let image = upload
        .take_file()
        .ok_or_else(|| ServiceError::InvalidRequest("No file uploaded".into()))?;

    let body = match engine.recognize(image, use_deep).await? {
        Recognition::Recognized {
            user_id,
            name,
            confidence,
            record,
        } => serde_json::json!({
            "success": true,
            "recognized": true,
            "user": { "userId": user_id, "name": name },
            "confidence": confidence,
            "attendanceRecorded": record.timestamp,
        }),
        Recognition::Unrecognized => serde_json::json!({
            "success": true,
            "recognized": false,
            "message": "Face not recognized",
        }),
    };
    Ok(Json(body).into_response())
}

async fn attendance(State(engine): State<Arc<Engine>>) -> Result<Response, ServiceError> {
    let records = engine.attendance().await?;
    Ok(Json(serde_json::json!({ "success": true, "records": records })).into_response())
}

async fn users(State(engine): State<Arc<Engine>>) -> Result<Response, ServiceError> {
    let users = engine.users().await?;
    Ok(Json(serde_json::json!({ "success": true, "users": users })).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrainRequest {
    #[serde(default)]
    force_retrain: bool,
}

async fn train_model(State(engine): State<Arc<Engine>>, body: Bytes) -> Result<Response, ServiceError> {
    let request: TrainRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TrainRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ServiceError::InvalidRequest(format!("Invalid JSON body: {e}")))?
    };

    let outcome = engine.train(request.force_retrain).await?;
    let (message, retrained) = match &outcome {
        TrainOutcome::AlreadyTrained { .. } => (
            "Model already trained; pass forceRetrain to rebuild it".to_string(),
            false,
        ),
        TrainOutcome::Trained { users, accuracy, .. } => (
            format!(
                "Model trained successfully on {users} users (training accuracy {:.1}%)",
                accuracy * 100.0
            ),
            true,
        ),
    };
    Ok(Json(serde_json::json!({
        "success": true,
        "message": message,
        "retrained": retrained,
        "modelVersion": outcome.version(),
    }))
    .into_response())
}

async fn status(State(engine): State<Arc<Engine>>) -> Result<Response, ServiceError> {
    Ok(Json(engine.status().await?).into_response())
}
