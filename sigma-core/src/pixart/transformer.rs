//! PixArt DiT denoiser: patchified latents, adaLN-single timestep
//! conditioning and cross-attention over projected T5 embeddings.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub num_attention_heads: usize,
    pub attention_head_dim: usize,
    pub in_channels: usize,
    pub out_channels: Option<usize>,
    pub num_layers: usize,
    pub patch_size: usize,
    pub sample_size: usize,
    pub caption_channels: usize,
    pub norm_eps: f64,
    pub interpolation_scale: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_attention_heads: 16,
            attention_head_dim: 72,
            in_channels: 4,
            out_channels: Some(8),
            num_layers: 28,
            patch_size: 2,
            sample_size: 128,
            caption_channels: 4096,
            norm_eps: 1e-6,
            interpolation_scale: None,
        }
    }
}

impl Config {
    pub fn inner_dim(&self) -> usize {
        self.num_attention_heads * self.attention_head_dim
    }

    fn out_channels(&self) -> usize {
        self.out_channels.unwrap_or(self.in_channels)
    }

    fn interpolation_scale(&self) -> f64 {
        self.interpolation_scale
            .unwrap_or_else(|| (self.sample_size / 64).max(1) as f64)
    }
}

const TIMESTEP_CHANNELS: usize = 256;

fn layer_norm(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let dtype = xs.dtype();
    let xs = xs.to_dtype(DType::F32)?;
    let mean = xs.mean_keepdim(D::Minus1)?;
    let xs = xs.broadcast_sub(&mean)?;
    let var = xs.sqr()?.mean_keepdim(D::Minus1)?;
    xs.broadcast_div(&(var + eps)?.sqrt()?)?.to_dtype(dtype)
}

/// `xs * (1 + scale) + shift`
fn modulate(xs: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    xs.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(shift)
}

/// Sinusoidal timestep features with cosines first.
fn timestep_features(timestep: f64, dim: usize, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f64> = (0..half)
        .map(|i| (-(10000f64.ln()) * i as f64 / half as f64).exp())
        .collect();
    let mut data = Vec::with_capacity(dim);
    data.extend(freqs.iter().map(|f| (timestep * f).cos() as f32));
    data.extend(freqs.iter().map(|f| (timestep * f).sin() as f32));
    Tensor::from_vec(data, (1, dim), device)
}

/// 2D sin-cos position table, `grid_h * grid_w` rows of `dim` values.
///
/// Each row holds the width coordinate's features followed by the height
/// coordinate's, positions being rescaled to the model's base grid.
pub(crate) fn position_table(
    dim: usize,
    grid_h: usize,
    grid_w: usize,
    base_size: f64,
    interpolation_scale: f64,
) -> Vec<f32> {
    let quarter = dim / 4;
    let omega: Vec<f64> = (0..quarter)
        .map(|i| 1.0 / 10000f64.powf(i as f64 / quarter as f64))
        .collect();
    let mut table = Vec::with_capacity(grid_h * grid_w * dim);
    for row in 0..grid_h {
        let pos_h = row as f64 / (grid_h as f64 / base_size) / interpolation_scale;
        for col in 0..grid_w {
            let pos_w = col as f64 / (grid_w as f64 / base_size) / interpolation_scale;
            for pos in [pos_w, pos_h] {
                table.extend(omega.iter().map(|w| (pos * w).sin() as f32));
                table.extend(omega.iter().map(|w| (pos * w).cos() as f32));
            }
        }
    }
    table
}

#[derive(Debug)]
struct Attention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    head_dim: usize,
    slice_size: usize,
}

impl Attention {
    fn new(
        vb: VarBuilder,
        dim: usize,
        heads: usize,
        head_dim: usize,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        let inner = heads * head_dim;
        Ok(Self {
            to_q: linear(dim, inner, vb.pp("to_q"))?,
            to_k: linear(dim, inner, vb.pp("to_k"))?,
            to_v: linear(dim, inner, vb.pp("to_v"))?,
            to_out: linear(inner, dim, vb.pp("to_out.0"))?,
            heads,
            head_dim,
            slice_size: slice_size.unwrap_or(heads).clamp(1, heads),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        xs.reshape((b, n, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(xs);
        let (b, n, _) = xs.dims3()?;
        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        // Attention slicing: only `slice_size` score matrices are alive at once.
        let mut outputs = Vec::with_capacity(self.heads.div_ceil(self.slice_size));
        for start in (0..self.heads).step_by(self.slice_size) {
            let len = self.slice_size.min(self.heads - start);
            let q = q.narrow(1, start, len)?;
            let k = k.narrow(1, start, len)?;
            let v = v.narrow(1, start, len)?.contiguous()?;
            let scores = (q.contiguous()?.matmul(&k.t()?.contiguous()?)? * scale)?;
            let probs = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
                .to_dtype(v.dtype())?;
            outputs.push(probs.matmul(&v)?);
        }
        let out = Tensor::cat(&outputs, 1)?
            .transpose(1, 2)?
            .reshape((b, n, self.heads * self.head_dim))?;
        self.to_out.forward(&out)
    }
}

#[derive(Debug)]
struct FeedForward {
    proj: Linear,
    out: Linear,
}

impl FeedForward {
    fn new(vb: VarBuilder, dim: usize) -> Result<Self> {
        let hidden = dim * 4;
        Ok(Self {
            proj: linear(dim, hidden, vb.pp("net.0.proj"))?,
            out: linear(hidden, dim, vb.pp("net.2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.out.forward(&self.proj.forward(xs)?.gelu()?)
    }
}

#[derive(Debug)]
struct TransformerBlock {
    attn1: Attention,
    attn2: Attention,
    ff: FeedForward,
    scale_shift_table: Tensor,
    eps: f64,
}

impl TransformerBlock {
    fn new(vb: VarBuilder, cfg: &Config, slice_size: Option<usize>) -> Result<Self> {
        let dim = cfg.inner_dim();
        let heads = cfg.num_attention_heads;
        let head_dim = cfg.attention_head_dim;
        Ok(Self {
            attn1: Attention::new(vb.pp("attn1"), dim, heads, head_dim, slice_size)?,
            attn2: Attention::new(vb.pp("attn2"), dim, heads, head_dim, slice_size)?,
            ff: FeedForward::new(vb.pp("ff"), dim)?,
            scale_shift_table: vb.get((6, dim), "scale_shift_table")?,
            eps: cfg.norm_eps,
        })
    }

    /// `timestep` is the adaLN-single output reshaped to `(1, 6, dim)`.
    fn forward(&self, xs: &Tensor, timestep: &Tensor, context: &Tensor) -> Result<Tensor> {
        let mods = self
            .scale_shift_table
            .unsqueeze(0)?
            .broadcast_add(timestep)?
            .chunk(6, 1)?;
        let (shift_msa, scale_msa, gate_msa) = (&mods[0], &mods[1], &mods[2]);
        let (shift_mlp, scale_mlp, gate_mlp) = (&mods[3], &mods[4], &mods[5]);

        let norm = modulate(&layer_norm(xs, self.eps)?, shift_msa, scale_msa)?;
        let attn = self.attn1.forward(&norm, None)?;
        let xs = (xs + attn.broadcast_mul(gate_msa)?)?;

        let attn = self.attn2.forward(&xs, Some(context))?;
        let xs = (xs + attn)?;

        let norm = modulate(&layer_norm(&xs, self.eps)?, shift_mlp, scale_mlp)?;
        let ff = self.ff.forward(&norm)?;
        xs + ff.broadcast_mul(gate_mlp)?
    }
}

#[derive(Debug)]
pub struct PixArtTransformer {
    patch_embed: Conv2d,
    timestep_linear_1: Linear,
    timestep_linear_2: Linear,
    adaln_linear: Linear,
    caption_linear_1: Linear,
    caption_linear_2: Linear,
    blocks: Vec<TransformerBlock>,
    final_table: Tensor,
    proj_out: Linear,
    cfg: Config,
}

impl PixArtTransformer {
    pub fn new(vb: VarBuilder, cfg: &Config, attention_slice: Option<usize>) -> Result<Self> {
        let dim = cfg.inner_dim();
        let patch = cfg.patch_size;
        let conv_cfg = Conv2dConfig {
            stride: patch,
            ..Default::default()
        };
        let patch_embed = conv2d(cfg.in_channels, dim, patch, conv_cfg, vb.pp("pos_embed.proj"))?;

        let adaln = vb.pp("adaln_single");
        let temb = adaln.pp("emb.timestep_embedder");
        let timestep_linear_1 = linear(TIMESTEP_CHANNELS, dim, temb.pp("linear_1"))?;
        let timestep_linear_2 = linear(dim, dim, temb.pp("linear_2"))?;
        let adaln_linear = linear(dim, 6 * dim, adaln.pp("linear"))?;

        let caption = vb.pp("caption_projection");
        let caption_linear_1 = linear(cfg.caption_channels, dim, caption.pp("linear_1"))?;
        let caption_linear_2 = linear(dim, dim, caption.pp("linear_2"))?;

        let blocks = (0..cfg.num_layers)
            .map(|i| TransformerBlock::new(vb.pp(format!("transformer_blocks.{i}")), cfg, attention_slice))
            .collect::<Result<Vec<_>>>()?;

        let final_table = vb.get((2, dim), "scale_shift_table")?;
        let proj_out = linear(dim, patch * patch * cfg.out_channels(), vb.pp("proj_out"))?;

        Ok(Self {
            patch_embed,
            timestep_linear_1,
            timestep_linear_2,
            adaln_linear,
            caption_linear_1,
            caption_linear_2,
            blocks,
            final_table,
            proj_out,
            cfg: cfg.clone(),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.cfg.num_attention_heads
    }

    pub fn latent_channels(&self) -> usize {
        self.cfg.in_channels
    }

    /// Projects T5 hidden states `(1, L, caption_channels)` into the model width.
    pub fn project_caption(&self, text: &Tensor) -> Result<Tensor> {
        let xs = self.caption_linear_1.forward(text)?.gelu()?;
        self.caption_linear_2.forward(&xs)
    }

    /// Predicts noise for `latents` of shape `(B, C, H, W)` at `timestep`.
    ///
    /// `context` is a projected caption from [`Self::project_caption`]. Only the
    /// noise half of a learned-sigma output is returned.
    pub fn forward(&self, latents: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor> {
        let (b, _, h, w) = latents.dims4()?;
        let dtype = latents.dtype();
        let device = latents.device();
        let dim = self.cfg.inner_dim();
        let patch = self.cfg.patch_size;
        let (grid_h, grid_w) = (h / patch, w / patch);

        let xs = self.patch_embed.forward(latents)?.flatten_from(2)?.transpose(1, 2)?;
        let base_size = (self.cfg.sample_size / patch) as f64;
        let table = position_table(
            dim,
            grid_h,
            grid_w,
            base_size,
            self.cfg.interpolation_scale(),
        );
        let pos = Tensor::from_vec(table, (1, grid_h * grid_w, dim), device)?.to_dtype(dtype)?;
        let mut xs = xs.broadcast_add(&pos)?;

        let features = timestep_features(timestep, TIMESTEP_CHANNELS, device)?.to_dtype(dtype)?;
        let embedded = self.timestep_linear_1.forward(&features)?;
        let embedded = self
            .timestep_linear_2
            .forward(&candle_nn::ops::silu(&embedded)?)?;
        let conditioning = self
            .adaln_linear
            .forward(&candle_nn::ops::silu(&embedded)?)?
            .reshape((1, 6, dim))?;

        let context = context.to_dtype(dtype)?.repeat((b, 1, 1))?;
        for block in &self.blocks {
            xs = block.forward(&xs, &conditioning, &context)?;
        }

        let mods = self
            .final_table
            .unsqueeze(0)?
            .broadcast_add(&embedded.unsqueeze(1)?)?
            .chunk(2, 1)?;
        let xs = modulate(&layer_norm(&xs, self.cfg.norm_eps)?, &mods[0], &mods[1])?;
        let xs = self.proj_out.forward(&xs)?;

        let out_channels = self.cfg.out_channels();
        let xs = xs
            .reshape(vec![b, grid_h, grid_w, patch, patch, out_channels])?
            .permute(vec![0, 5, 1, 3, 2, 4])?
            .reshape((b, out_channels, h, w))?;
        xs.narrow(1, 0, self.cfg.in_channels.min(out_channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> Config {
        Config {
            num_attention_heads: 2,
            attention_head_dim: 4,
            in_channels: 4,
            out_channels: Some(8),
            num_layers: 2,
            patch_size: 2,
            sample_size: 8,
            caption_channels: 6,
            norm_eps: 1e-6,
            interpolation_scale: None,
        }
    }

    #[test]
    fn test_config_defaults_match_sigma() {
        let cfg: Config = serde_json::from_str(r#"{"sample_size": 128}"#).expect("config");
        assert_eq!(cfg.inner_dim(), 1152);
        assert_eq!(cfg.interpolation_scale(), 2.0);
        assert_eq!(cfg.out_channels(), 8);
    }

    #[test]
    fn test_position_table_layout() {
        let table = position_table(8, 2, 3, 2.0, 1.0);
        assert_eq!(table.len(), 2 * 3 * 8);
        // Origin: sin(0) = 0, cos(0) = 1 for both axes.
        assert_eq!(&table[..8], &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
        // Row 0, column 1: width features move, height features stay at origin.
        let row = &table[8..16];
        assert!(row[0] != 0.0);
        assert_eq!(&row[4..], &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_timestep_features_start_with_cosines() -> Result<()> {
        let features = timestep_features(0.0, 8, &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(features, vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let cfg = tiny_config();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = PixArtTransformer::new(vb, &cfg, Some(1))?;

        let latents = Tensor::randn(0f32, 1f32, (2, 4, 8, 6), &device)?;
        let text = Tensor::randn(0f32, 1f32, (1, 5, 6), &device)?;
        let context = model.project_caption(&text)?;
        let out = model.forward(&latents, 500.0, &context)?;
        assert_eq!(out.dims(), &[2, 4, 8, 6]);
        Ok(())
    }

    #[test]
    fn test_attention_slicing_matches_full() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let full = Attention::new(vb.pp("attn"), 8, 4, 2, None)?;
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let sliced = Attention::new(vb.pp("attn"), 8, 4, 2, Some(3))?;

        let xs = Tensor::randn(0f32, 1f32, (1, 5, 8), &device)?;
        let diff = (full.forward(&xs, None)? - sliced.forward(&xs, None)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
