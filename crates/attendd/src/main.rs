use anyhow::{Context, Result};
use attend_core::{DetectorError, FaceDetector, SkinRegionDetector};
use crate::config::{Config, DetectorKind};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod http;
mod ledger;
mod service;
mod store;
mod trainer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        detector = ?config.detector,
        "attendd starting"
    );

    let detector = build_detector(&config).context("failed to initialise face detector")?;
    let engine = Arc::new(service::Engine::open(&config, detector).await?);
    let app = http::router(engine, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "attendd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("attendd shutting down");
    Ok(())
}

fn build_detector(config: &Config) -> Result<Arc<dyn FaceDetector>, DetectorError> {
    match config.detector {
        DetectorKind::Skin => Ok(Arc::new(SkinRegionDetector::default())),
        #[cfg(feature = "onnx")]
        DetectorKind::Scrfd => Ok(Arc::new(attend_core::scrfd::ScrfdDetector::load(&config.scrfd_model)?)),
        #[cfg(not(feature = "onnx"))]
        DetectorKind::Scrfd => Err(DetectorError::Unavailable("scrfd".into())),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
