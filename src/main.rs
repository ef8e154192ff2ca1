use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod api;
mod calibration;
mod config;
mod db;
mod engine;
mod error;
mod features;
mod jobs;
mod model;
mod pipeline;
mod tickets;

use api::AppState;
use calibration::CalibrationStore;
use config::Config;
use db::Database;
use engine::Engine;
use features::SqliteFeatureStore;
use jobs::JobIntervals;
use model::{ModelSnapshot, ModelStore};
use pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Resolve the published model state: last trained version if present,
    // neutral bootstrap otherwise.
    let snapshot = match db.load_active_model()? {
        Some((params, strengths)) => {
            info!(
                model_version = %params.model_version,
                teams = strengths.len(),
                "loaded active model"
            );
            let blend = db.load_blend_model(&params.model_version)?;
            let ev_threshold = db.load_latest_threshold()?.unwrap_or(config.ev_threshold);
            ModelSnapshot {
                params,
                strengths,
                blend,
                ev_threshold,
                published_at: chrono::Utc::now(),
            }
        }
        None => {
            info!("no trained model found; starting from neutral priors");
            ModelSnapshot::bootstrap("bootstrap", config.xi)
        }
    };
    let learned_threshold = db.load_latest_threshold()?;
    let models = ModelStore::new(snapshot);

    let calibrations = CalibrationStore::new(db.clone());
    let pipeline_config = config.pipeline_config(learned_threshold);
    let pipeline = Pipeline::new(
        Arc::new(SqliteFeatureStore::new(db.clone())),
        calibrations.clone(),
        models.clone(),
        pipeline_config,
    );
    let engine = Engine::new(db.clone(), pipeline);

    // Background maintenance: training, calibration refit, threshold
    // learning.
    jobs::spawn_all(
        db.clone(),
        models,
        calibrations.clone(),
        pipeline_config,
        JobIntervals {
            training_secs: config.training_interval_secs,
            calibration_secs: config.calibration_interval_secs,
            threshold_secs: config.threshold_interval_secs,
        },
    );

    // Serve the API
    let state = AppState {
        engine,
        calibrations,
        request_budget: Duration::from_millis(config.request_budget_ms),
    };
    let app = api::router(state);
    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
