use candle_core::{Device, Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.0001;
const BETA_END: f64 = 0.02;

/// Gaussian latent noise drawn from a generator seeded with `seed`.
pub fn seeded_noise(seed: u64, shape: (usize, usize, usize, usize), device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (b, c, h, w) = shape;
    let data: Vec<f32> = (0..b * c * h * w)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_vec(data, shape, device)
}

/// Deterministic DDIM sampler over a linear beta schedule.
#[derive(Debug, Clone)]
pub struct Ddim {
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl Ddim {
    pub fn new(steps: usize) -> Self {
        let steps = steps.clamp(1, TRAIN_TIMESTEPS);
        let mut alphas_cumprod = Vec::with_capacity(TRAIN_TIMESTEPS);
        let mut acc = 1.0;
        for i in 0..TRAIN_TIMESTEPS {
            let beta =
                BETA_START + (BETA_END - BETA_START) * i as f64 / (TRAIN_TIMESTEPS - 1) as f64;
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        let step_ratio = TRAIN_TIMESTEPS / steps;
        let timesteps = (0..steps).map(|i| i * step_ratio).rev().collect();
        Self {
            alphas_cumprod,
            timesteps,
            step_ratio,
        }
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Moves `sample` from `timestep` to the previous timestep given the
    /// predicted noise.
    pub fn step(&self, noise_pred: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha = self.alphas_cumprod[timestep];
        let alpha_prev = if timestep >= self.step_ratio {
            self.alphas_cumprod[timestep - self.step_ratio]
        } else {
            1.0
        };
        let sample_coef = (alpha_prev / alpha).sqrt();
        let noise_coef = (1.0 - alpha_prev).sqrt() - (alpha_prev * (1.0 - alpha) / alpha).sqrt();
        sample.affine(sample_coef, 0.0)? + noise_pred.affine(noise_coef, 0.0)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_is_reproducible() -> Result<()> {
        let a = seeded_noise(42, (1, 4, 8, 8), &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        let b = seeded_noise(42, (1, 4, 8, 8), &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        let c = seeded_noise(43, (1, 4, 8, 8), &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn test_timesteps_descend_to_zero() {
        let ddim = Ddim::new(20);
        let timesteps = ddim.timesteps();
        assert_eq!(timesteps.len(), 20);
        assert_eq!(timesteps[0], 950);
        assert_eq!(timesteps[19], 0);
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_final_step_recovers_clean_sample() -> Result<()> {
        let ddim = Ddim::new(10);
        let alpha = ddim.alphas_cumprod[0];
        let clean = Tensor::new(&[0.5f32, -0.25, 1.0], &Device::Cpu)?;
        let noise = Tensor::new(&[0.1f32, 0.2, -0.3], &Device::Cpu)?;
        let noisy = (clean.affine(alpha.sqrt(), 0.0)? + noise.affine((1.0 - alpha).sqrt(), 0.0)?)?;

        let denoised = ddim.step(&noise, 0, &noisy)?.to_vec1::<f32>()?;
        for (got, want) in denoised.iter().zip([0.5f32, -0.25, 1.0]) {
            assert!((got - want).abs() < 1e-5);
        }
        Ok(())
    }
}
