//! The generation service: owns the pipeline handle and turns requests into
//! encoded images.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
    extract_images, image_to_base64_png, normalize_to_dynamic, DeviceMap, GenerationError,
    GenerationParams, GenerationRequest, Loader, Pipeline, PipelineError, PipelineOutput,
    RawImage, PNG_CONTENT_TYPE,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
}

serde_plain::derive_display_from_serialize!(Status);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    /// Base64 PNGs in generation order.
    pub images: Vec<String>,
    pub seed_used: u64,
    pub status: Status,
    /// Images that were generated but could not be encoded.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skipped: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedFile {
    pub filename: String,
    pub data: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileGenerationResult {
    pub images: Vec<GeneratedFile>,
    pub seed_used: u64,
    pub status: Status,
    pub count: usize,
}

impl From<GenerationResult> for FileGenerationResult {
    fn from(result: GenerationResult) -> Self {
        let seed = result.seed_used;
        let images: Vec<GeneratedFile> = result
            .images
            .into_iter()
            .enumerate()
            .map(|(index, data)| GeneratedFile {
                filename: format!("generated_image_{seed}_{}.png", index + 1),
                data,
                content_type: PNG_CONTENT_TYPE.to_string(),
            })
            .collect();
        Self {
            count: images.len(),
            images,
            seed_used: seed,
            status: result.status,
        }
    }
}

/// Shared entry point for every generation request.
///
/// The pipeline is loaded by [`GenerationService::initialize`], normally once
/// at startup. If that failed, the next request tries again.
pub struct GenerationService<L: Loader> {
    loader: L,
    device_map: DeviceMap,
    pipeline: RwLock<Option<Arc<L::Pipeline>>>,
    init_lock: Mutex<()>,
}

impl<L: Loader> GenerationService<L> {
    pub fn new(loader: L, device_map: DeviceMap) -> Self {
        Self {
            loader,
            device_map,
            pipeline: RwLock::new(None),
            init_lock: Mutex::new(()),
        }
    }

    pub fn model_id(&self) -> &str {
        self.loader.model_id()
    }

    pub fn device_map(&self) -> DeviceMap {
        self.device_map
    }

    pub async fn is_ready(&self) -> bool {
        self.pipeline.read().await.is_some()
    }

    /// Loads the pipeline and checks it with a smoke-test generation.
    ///
    /// Does nothing when a pipeline is already loaded.
    pub async fn initialize(&self) -> Result<(), GenerationError> {
        let _guard = self.init_lock.lock().await;
        if self.is_ready().await {
            return Ok(());
        }

        info!(model = self.model_id(), device = ?self.device_map, "Loading pipeline");
        let started = Instant::now();
        let pipeline = self.loader.load(self.device_map).await.map_err(|e| {
            error!("Failed to load pipeline: {e:#}");
            GenerationError::PipelineUnavailable(format!("failed to load pipeline: {e:#}"))
        })?;
        let pipeline = Arc::new(pipeline);
        info!("Pipeline loaded in {:.1}s", started.elapsed().as_secs_f64());

        let output = run_blocking(pipeline.clone(), GenerationParams::smoke_test())
            .await
            .map_err(|e| {
                error!("Pipeline smoke test failed: {e:#}");
                GenerationError::PipelineUnavailable(format!("smoke test failed: {e:#}"))
            })?;
        if extract_images(&output).is_empty() {
            error!("Pipeline smoke test produced no images");
            return Err(GenerationError::PipelineUnavailable(
                "smoke test produced no images".to_string(),
            ));
        }

        *self.pipeline.write().await = Some(pipeline);
        info!("Pipeline ready");
        Ok(())
    }

    async fn pipeline(&self) -> Result<Arc<L::Pipeline>, GenerationError> {
        if let Some(pipeline) = self.pipeline.read().await.as_ref() {
            return Ok(pipeline.clone());
        }
        warn!("Pipeline not loaded, initializing on demand");
        self.initialize().await?;
        self.pipeline
            .read()
            .await
            .clone()
            .ok_or_else(|| GenerationError::PipelineUnavailable("pipeline not loaded".to_string()))
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        let params = GenerationParams::resolve(request)?;
        let pipeline = self.pipeline().await?;

        info!(
            width = params.width,
            height = params.height,
            steps = params.steps,
            num_images = params.num_images,
            seed = params.seed,
            "Generating: {}",
            params.prompt
        );
        let started = Instant::now();

        let output = match run_blocking(pipeline.clone(), params.clone()).await {
            Err(err) if err.is_out_of_memory() => {
                let reduced = params.reduced();
                warn!(
                    "{err}, retrying at {}x{} with {} steps and {} image",
                    reduced.width,
                    reduced.height,
                    reduced.steps,
                    reduced.num_images
                );
                run_blocking(pipeline, reduced)
                    .await
                    .map_err(|e| surface(e, &params))?
            }
            other => other.map_err(|e| surface(e, &params))?,
        };

        let raw_images = extract_images(&output);
        if raw_images.is_empty() {
            error!(seed = params.seed, "No images found in pipeline output");
            return Err(GenerationError::NoImages);
        }

        let total = raw_images.len();
        let (images, skipped) = tokio::task::spawn_blocking(move || encode_all(raw_images))
            .await
            .map_err(|e| GenerationError::PipelineFailed(format!("encoding task failed: {e}")))?;
        if images.is_empty() {
            error!("All {total} generated images failed to encode");
            return Err(GenerationError::EncodingFailed(total));
        }

        let result = GenerationResult {
            images,
            seed_used: params.seed,
            status: Status::Success,
            skipped,
        };
        info!(
            status = %result.status,
            images = result.images.len(),
            skipped,
            "Generated in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(result)
    }

    /// Same as [`Self::generate`], with each image wrapped as a named PNG file.
    pub async fn generate_files(
        &self,
        request: GenerationRequest,
    ) -> Result<FileGenerationResult, GenerationError> {
        self.generate(request).await.map(FileGenerationResult::from)
    }
}

async fn run_blocking<P: Pipeline + 'static>(
    pipeline: Arc<P>,
    params: GenerationParams,
) -> Result<PipelineOutput, PipelineError> {
    tokio::task::spawn_blocking(move || pipeline.run(&params))
        .await
        .map_err(|e| PipelineError::Failed(anyhow::anyhow!("pipeline task failed: {e}")))?
}

fn surface(err: PipelineError, params: &GenerationParams) -> GenerationError {
    error!(seed = params.seed, "Generation failed: {err:#}");
    match err {
        PipelineError::OutOfMemory { .. } | PipelineError::DeviceOutOfMemory(_) => {
            GenerationError::OutOfMemory(err.to_string())
        }
        PipelineError::Failed(e) => GenerationError::PipelineFailed(format!("{e:#}")),
    }
}

fn encode_all(raw_images: Vec<RawImage>) -> (Vec<String>, usize) {
    let mut images = Vec::with_capacity(raw_images.len());
    let mut skipped = 0;
    for (index, raw) in raw_images.into_iter().enumerate() {
        match normalize_to_dynamic(raw).and_then(|img| image_to_base64_png(&img)) {
            Ok(encoded) => images.push(encoded),
            Err(e) => {
                warn!("Skipping image {index}: {e:#}");
                skipped += 1;
            }
        }
    }
    (images, skipped)
}
