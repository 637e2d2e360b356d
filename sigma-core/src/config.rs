//! Compiled-in model identifiers, request limits and optimization flags.

/// Hub repository holding the PixArt-Σ transformer and VAE.
pub const MODEL_ID: &str = "PixArt-alpha/PixArt-Sigma-XL-2-1024-MS";

pub const TEXT_ENCODER_ID: &str = "google/t5-v1_1-xxl";
pub const TEXT_ENCODER_REVISION: &str = "refs/pr/2";
pub const TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
pub const TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";

pub const DEFAULT_SIZE: u32 = 1024;
pub const MIN_SIZE: u32 = 256;
pub const MAX_SIZE: u32 = 2048;
/// Width and height are rounded down to this (VAE factor 8 times patch size 2).
pub const SIZE_MULTIPLE: u32 = 16;

pub const DEFAULT_STEPS: u32 = 20;
pub const MAX_STEPS: u32 = 100;
pub const DEFAULT_GUIDANCE: f64 = 4.5;
pub const DEFAULT_NUM_IMAGES: u32 = 1;
pub const MAX_IMAGES: u32 = 4;

/// Upper bound (inclusive) for randomly drawn seeds.
pub const MAX_RANDOM_SEED: u64 = 2_147_483_647;

/// Limits applied when retrying after memory exhaustion.
pub const REDUCED_MAX_SIZE: u32 = 512;
pub const REDUCED_MAX_STEPS: u32 = 10;

/// Maximum number of T5 tokens fed to the transformer.
pub const MAX_TEXT_TOKENS: usize = 300;
pub const VAE_SCALING_FACTOR: f64 = 0.13025;

/// Memory and speed trade-offs applied when the pipeline is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Optimizations {
    /// Number of attention heads computed at once, `None` for all of them.
    pub attention_slice: Option<usize>,
    /// Decode latents one image at a time.
    pub vae_slicing: bool,
    /// Activation memory a single run may claim.
    pub memory_budget_bytes: u64,
}

pub const CPU_OPTIMIZATIONS: Optimizations = Optimizations {
    attention_slice: Some(4),
    vae_slicing: true,
    memory_budget_bytes: 6 << 30,
};
