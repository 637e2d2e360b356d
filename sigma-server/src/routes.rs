use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use sigma_core::{
    config::{
        DEFAULT_GUIDANCE, DEFAULT_NUM_IMAGES, DEFAULT_SIZE, DEFAULT_STEPS, MAX_IMAGES, MAX_SIZE,
        MAX_STEPS, MIN_SIZE,
    },
    DeviceMap, FileGenerationResult, GenerationRequest, GenerationResult, GenerationService,
    Loader, RuntimeInfo,
};
use tracing::error;

use crate::error::ApiError;

pub type AppState<L> = Arc<GenerationService<L>>;

pub fn router<L: Loader + 'static>(state: AppState<L>) -> Router {
    Router::new()
        .route("/", get(root::<L>))
        .route("/health", get(health::<L>))
        .route("/info", get(info::<L>))
        .route("/generate", post(generate::<L>))
        .route("/generate-file", post(generate_file::<L>))
        .with_state(state)
}

async fn root<L: Loader + 'static>(State(state): State<AppState<L>>) -> impl IntoResponse {
    Json(json!({
        "message": "PixArt-Sigma image generation API",
        "model": state.model_id(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: HealthStatus,
    pipeline_loaded: bool,
    model: String,
    device: &'static str,
    runtime: RuntimeInfo,
}

async fn health<L: Loader + 'static>(State(state): State<AppState<L>>) -> impl IntoResponse {
    let pipeline_loaded = state.is_ready().await;
    Json(HealthResponse {
        status: if pipeline_loaded {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        },
        pipeline_loaded,
        model: state.model_id().to_string(),
        device: device_label(state.device_map()),
        runtime: RuntimeInfo::detect(),
    })
}

fn device_label(device_map: DeviceMap) -> &'static str {
    match device_map {
        DeviceMap::ForceCpu => "cpu",
        DeviceMap::Ordinal(_) => "accelerator",
    }
}

async fn info<L: Loader + 'static>(State(state): State<AppState<L>>) -> impl IntoResponse {
    let pipeline_loaded = state.is_ready().await;
    Json(json!({
        "model": state.model_id(),
        "pipeline_loaded": pipeline_loaded,
        "device": device_label(state.device_map()),
        "min_size": MIN_SIZE,
        "max_size": MAX_SIZE,
        "max_images": MAX_IMAGES,
        "max_steps": MAX_STEPS,
        "defaults": {
            "width": DEFAULT_SIZE,
            "height": DEFAULT_SIZE,
            "num_inference_steps": DEFAULT_STEPS,
            "guidance_scale": DEFAULT_GUIDANCE,
            "num_images": DEFAULT_NUM_IMAGES,
        },
        "endpoints": ["/", "/health", "/info", "/generate", "/generate-file"],
    }))
}

async fn generate<L: Loader + 'static>(
    State(state): State<AppState<L>>,
    Json(req): Json<GenerationRequest>,
) -> Result<Json<GenerationResult>, ApiError> {
    state.generate(req).await.map(Json).map_err(|e| {
        error!("Error generating image: {e}");
        e.into()
    })
}

async fn generate_file<L: Loader + 'static>(
    State(state): State<AppState<L>>,
    Json(req): Json<GenerationRequest>,
) -> Result<Json<FileGenerationResult>, ApiError> {
    state.generate_files(req).await.map(Json).map_err(|e| {
        error!("Error generating image file: {e}");
        e.into()
    })
}
