use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_GUIDANCE, DEFAULT_NUM_IMAGES, DEFAULT_SIZE, DEFAULT_STEPS, MAX_IMAGES,
    MAX_RANDOM_SEED, MAX_SIZE, MAX_STEPS, MIN_SIZE, REDUCED_MAX_SIZE, REDUCED_MAX_STEPS,
    SIZE_MULTIPLE,
};
use crate::GenerationError;

// Define the request/response types.
//
// Numeric fields are signed so that out-of-range values, negative ones
// included, reach `GenerationParams::resolve` and get clamped there.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_size")]
    pub width: i64,
    #[serde(default = "default_size")]
    pub height: i64,
    #[serde(default = "default_steps")]
    pub num_inference_steps: i64,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f64,
    #[serde(default = "default_num_images")]
    pub num_images: i64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_size() -> i64 {
    DEFAULT_SIZE.into()
}

fn default_steps() -> i64 {
    DEFAULT_STEPS.into()
}

fn default_guidance() -> f64 {
    DEFAULT_GUIDANCE
}

fn default_num_images() -> i64 {
    DEFAULT_NUM_IMAGES.into()
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: default_size(),
            height: default_size(),
            num_inference_steps: default_steps(),
            guidance_scale: DEFAULT_GUIDANCE,
            num_images: default_num_images(),
            seed: None,
        }
    }
}

/// A validated request with every numeric field clamped and the seed fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub num_images: usize,
    pub seed: u64,
}

impl GenerationParams {
    pub fn resolve(request: GenerationRequest) -> Result<Self, GenerationError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(GenerationError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        let guidance = if request.guidance_scale.is_finite() {
            request.guidance_scale.max(1.0)
        } else {
            1.0
        };
        let seed = request
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..=MAX_RANDOM_SEED));

        Ok(Self {
            prompt: prompt.to_string(),
            negative_prompt: request
                .negative_prompt
                .unwrap_or_default()
                .trim()
                .to_string(),
            width: clamp_size(request.width),
            height: clamp_size(request.height),
            steps: clamp_count(request.num_inference_steps, MAX_STEPS),
            guidance,
            num_images: clamp_count(request.num_images, MAX_IMAGES),
            seed,
        })
    }

    /// Cheaper parameters used for the single retry after memory exhaustion.
    pub fn reduced(&self) -> Self {
        Self {
            width: self.width.min(REDUCED_MAX_SIZE as usize),
            height: self.height.min(REDUCED_MAX_SIZE as usize),
            steps: self.steps.min(REDUCED_MAX_STEPS as usize),
            num_images: 1,
            ..self.clone()
        }
    }

    /// Smallest possible run, used to check a freshly loaded pipeline.
    pub fn smoke_test() -> Self {
        Self {
            prompt: "a red apple on a table".to_string(),
            negative_prompt: String::new(),
            width: MIN_SIZE as usize,
            height: MIN_SIZE as usize,
            steps: 1,
            guidance: 1.0,
            num_images: 1,
            seed: 0,
        }
    }

    pub fn uses_guidance(&self) -> bool {
        self.guidance > 1.0
    }
}

fn clamp_size(size: i64) -> usize {
    let size = size.clamp(MIN_SIZE.into(), MAX_SIZE.into()) as usize;
    size - size % SIZE_MULTIPLE as usize
}

fn clamp_count(count: i64, max: u32) -> usize {
    count.clamp(1, max.into()) as usize
}
