use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod sampling;
mod transformer;

use crate::config::{
    Optimizations, CPU_OPTIMIZATIONS, MAX_TEXT_TOKENS, MODEL_ID, TEXT_ENCODER_ID,
    TEXT_ENCODER_REVISION, TOKENIZER_FILE, TOKENIZER_REPO, VAE_SCALING_FACTOR,
};
use crate::{
    device_name, select_best_device, DeviceMap, GenerationParams, Loader, Pipeline,
    PipelineError, PipelineOutput,
};
use sampling::{seeded_noise, Ddim};
use transformer::PixArtTransformer;

/// Channels of the VAE decoder's widest full-resolution activation.
const VAE_DECODER_CHANNELS: u64 = 128;

/// Rough peak activation memory of one run, in bytes.
///
/// Takes the larger of the attention score matrices alive inside a slice and
/// the VAE decoder's full-resolution activations.
fn estimate_activation_bytes(
    params: &GenerationParams,
    heads: usize,
    optimizations: &Optimizations,
) -> u64 {
    let tokens = ((params.height / 16) * (params.width / 16)) as u64;
    let slice = optimizations.attention_slice.unwrap_or(heads).clamp(1, heads.max(1)) as u64;
    let attention = params.num_images as u64 * slice * tokens * tokens * 4;
    let decode_batch = if optimizations.vae_slicing {
        1
    } else {
        params.num_images as u64
    };
    let pixels = (params.height * params.width) as u64;
    let vae = decode_batch * pixels * VAE_DECODER_CHANNELS * 4 * 3;
    attention.max(vae)
}

pub struct PixArtPipeline {
    device: Device,
    dtype: DType,
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    transformer: PixArtTransformer,
    vae: AutoEncoderKL,
    optimizations: Optimizations,
}

impl PixArtPipeline {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(MAX_TEXT_TOKENS);
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let embedding = {
            let mut t5 = self
                .t5_model
                .lock()
                .map_err(|_| anyhow!("text encoder lock poisoned"))?;
            t5.forward(&input_ids)?
        };
        Ok(self
            .transformer
            .project_caption(&embedding.to_dtype(self.dtype)?)?)
    }

    fn generate(&self, params: &GenerationParams) -> Result<PipelineOutput> {
        let cond = self.encode_prompt(&params.prompt)?;
        let uncond = if params.uses_guidance() {
            Some(self.encode_prompt(&params.negative_prompt)?)
        } else {
            None
        };

        let shape = (
            params.num_images,
            self.transformer.latent_channels(),
            params.height / 8,
            params.width / 8,
        );
        let mut latents = seeded_noise(params.seed, shape, &self.device)?.to_dtype(self.dtype)?;

        let scheduler = Ddim::new(params.steps);
        for (index, &timestep) in scheduler.timesteps().iter().enumerate() {
            let noise_cond = self.transformer.forward(&latents, timestep as f64, &cond)?;
            let noise_pred = match &uncond {
                Some(uncond) => {
                    let noise_uncond = self.transformer.forward(&latents, timestep as f64, uncond)?;
                    let delta = ((noise_cond - &noise_uncond)? * params.guidance)?;
                    (noise_uncond + delta)?
                }
                None => noise_cond,
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!("Denoising step {}/{}", index + 1, params.steps);
        }

        let latents = (latents.to_dtype(DType::F32)? / VAE_SCALING_FACTOR)?;
        let batches = if self.optimizations.vae_slicing {
            (0..params.num_images)
                .map(|i| latents.narrow(0, i, 1))
                .collect::<candle_core::Result<Vec<_>>>()?
        } else {
            vec![latents]
        };

        let mut images = Vec::with_capacity(batches.len());
        for batch in batches {
            let decoded = self.vae.decode(&batch)?.to_dtype(DType::F32)?;
            let decoded = ((decoded / 2.0)? + 0.5)?.clamp(0f32, 1f32)?;
            images.push(PipelineOutput::Tensor(decoded));
        }
        debug!("Decoded {} image(s)", params.num_images);

        Ok(PipelineOutput::images(images))
    }
}

impl Pipeline for PixArtPipeline {
    fn run(&self, params: &GenerationParams) -> Result<PipelineOutput, PipelineError> {
        let required =
            estimate_activation_bytes(params, self.transformer.num_heads(), &self.optimizations);
        let budget = self.optimizations.memory_budget_bytes;
        if required > budget {
            return Err(PipelineError::OutOfMemory { required, budget });
        }
        self.generate(params).map_err(PipelineError::from_runtime)
    }
}

/// Files fetched from the hub before anything is built.
struct WeightFiles {
    t5_config: PathBuf,
    t5_model: PathBuf,
    t5_tokenizer: PathBuf,
    transformer_config: PathBuf,
    transformer_model: PathBuf,
    vae_model: PathBuf,
}

pub struct PixArtLoader {
    api: Api,
    optimizations: Optimizations,
}

impl PixArtLoader {
    pub fn new() -> Result<Self> {
        Ok(Self::with_api(Api::new()?))
    }

    pub fn with_api(api: Api) -> Self {
        Self {
            api,
            optimizations: CPU_OPTIMIZATIONS,
        }
    }

    async fn fetch(&self) -> Result<WeightFiles> {
        let t5_repo = self.api.repo(hf_hub::Repo::with_revision(
            TEXT_ENCODER_ID.to_string(),
            hf_hub::RepoType::Model,
            TEXT_ENCODER_REVISION.to_string(),
        ));
        let t5_config = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let t5_model = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to get T5 model file")?;
        let t5_tokenizer = self
            .api
            .model(TOKENIZER_REPO.to_string())
            .get(TOKENIZER_FILE)
            .await
            .context("failed to get T5 tokenizer")?;

        let pixart_repo = self.api.model(MODEL_ID.to_string());
        let transformer_config = pixart_repo
            .get("transformer/config.json")
            .await
            .context("failed to get transformer config")?;
        let transformer_model = pixart_repo
            .get("transformer/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get transformer model file")?;
        let vae_model = pixart_repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get VAE model file")?;

        Ok(WeightFiles {
            t5_config,
            t5_model,
            t5_tokenizer,
            transformer_config,
            transformer_model,
            vae_model,
        })
    }

    fn build(&self, files: WeightFiles, device: Device) -> Result<PixArtPipeline> {
        let dtype = device.bf16_default_to_f32();

        // --- T5 text encoder ---
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[files.t5_model], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- PixArt transformer ---
        let config_str = std::fs::read_to_string(&files.transformer_config)
            .context("failed to read transformer config")?;
        let transformer_config: transformer::Config =
            serde_json::from_str(&config_str).context("failed to parse transformer config")?;
        let transformer_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[files.transformer_model],
                dtype,
                &device,
            )
            .context("failed to build transformer var builder")?
        };
        let transformer = PixArtTransformer::new(
            transformer_vb,
            &transformer_config,
            self.optimizations.attention_slice,
        )
        .context("failed to load transformer")?;

        // --- VAE (SDXL layout), kept in f32 ---
        let vae_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[files.vae_model], DType::F32, &device)
                .context("failed to build VAE var builder")?
        };
        let vae_config = AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            use_quant_conv: true,
            use_post_quant_conv: true,
        };
        let vae = AutoEncoderKL::new(vae_vb, 3, 3, vae_config).context("failed to load VAE")?;

        Ok(PixArtPipeline {
            device,
            dtype,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            transformer,
            vae,
            optimizations: self.optimizations,
        })
    }
}

impl Loader for PixArtLoader {
    type Pipeline = PixArtPipeline;

    async fn load(&self, device_map: DeviceMap) -> Result<PixArtPipeline> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        info!(device = device_name(&device), "Fetching {MODEL_ID} weights");
        let files = self.fetch().await?;
        info!(
            attention_slice = ?self.optimizations.attention_slice,
            vae_slicing = self.optimizations.vae_slicing,
            "Building pipeline"
        );
        self.build(files, device)
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }
}
