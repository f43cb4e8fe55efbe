use std::f64::consts::FRAC_PI_2;

use burn::tensor::{backend::Backend, Tensor};

use super::{index_of, Scheduler, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, SchedulerKind};
use crate::schedule::linspace;
use crate::tensor::NoiseGenerator;

const COSINE_OFFSET: f64 = 0.008;
const TIME_SCALE: f64 = 1000.0;

/// DDPM over a continuous cosine schedule, used by the cascade prior and decoder.
#[derive(Debug, Clone)]
pub struct WuerstchenScheduler {
    timesteps: Vec<usize>,
    init_alpha_cumprod: f64,
    noise: NoiseGenerator,
}

impl WuerstchenScheduler {
    pub fn new(options: &GenerationOptions) -> Self {
        let mut timesteps: Vec<usize> = linspace(0.0, TIME_SCALE, options.inference_steps + 1)
            .into_iter()
            .skip(1)
            .map(|t| t as usize)
            .collect();
        timesteps.sort_unstable_by(|a, b| b.cmp(a));

        Self {
            timesteps,
            init_alpha_cumprod: cosine(0.0),
            noise: NoiseGenerator::new(options.seed),
        }
    }

    /// Cumulative alpha at a timestep on the `0..=1000` scale.
    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        (cosine(timestep as f64 / TIME_SCALE) / self.init_alpha_cumprod).clamp(1e-4, 0.9999)
    }

    fn previous_timestep(&self, timestep: usize) -> usize {
        let index = index_of(&self.timesteps, timestep);
        self.timesteps.get(index + 1).copied().unwrap_or(0)
    }
}

fn cosine(t: f64) -> f64 {
    ((t + COSINE_OFFSET) / (1.0 + COSINE_OFFSET) * FRAC_PI_2).cos().powi(2)
}

impl<B: Backend> Scheduler<B> for WuerstchenScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::DdpmWuerstchen
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn model_timestep(&self, timestep: usize) -> f64 {
        timestep as f64 / TIME_SCALE
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let alpha_cumprod = self.alpha_cumprod(timestep);
        let alpha_cumprod_prev = self.alpha_cumprod(self.previous_timestep(timestep));
        let alpha = alpha_cumprod / alpha_cumprod_prev;

        let pred_original = (sample.clone() - model_output.clone() * (1.0 - alpha_cumprod).sqrt()).div_scalar(alpha_cumprod.sqrt());

        let mean = (sample.clone() - model_output * ((1.0 - alpha) / (1.0 - alpha_cumprod).sqrt())) * (1.0 / alpha).sqrt();
        let std = ((1.0 - alpha) * (1.0 - alpha_cumprod_prev) / (1.0 - alpha_cumprod)).sqrt();
        let noise = self.noise.sample::<B, 4>(sample.dims(), 1.0, &sample.device());

        Ok(StepResult {
            prev_sample: mean + noise * std,
            pred_original,
        })
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let alpha_cumprod = self.alpha_cumprod(timestep);
        original * alpha_cumprod.sqrt() + noise * (1.0 - alpha_cumprod).sqrt()
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }
}
