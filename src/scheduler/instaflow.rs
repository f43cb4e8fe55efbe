use burn::tensor::{backend::Backend, Tensor};

use super::{Scheduler, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, SchedulerKind};
use crate::tensor::NoiseGenerator;

const TIME_SCALE: f64 = 1000.0;

/// Rectified-flow sampler for distilled one-step models. The denoiser predicts a velocity
/// and each step advances a fixed `1/N` along it.
#[derive(Debug, Clone)]
pub struct InstaFlowScheduler {
    timesteps: Vec<usize>,
    noise: NoiseGenerator,
}

impl InstaFlowScheduler {
    pub fn new(options: &GenerationOptions) -> Self {
        let steps = options.inference_steps.max(1);
        let timesteps = (0..steps)
            .map(|i| ((1.0 - i as f64 / steps as f64) * TIME_SCALE) as usize)
            .collect();

        Self {
            timesteps,
            noise: NoiseGenerator::new(options.seed),
        }
    }

    fn step_size(&self) -> f64 {
        1.0 / self.timesteps.len().max(1) as f64
    }
}

impl<B: Backend> Scheduler<B> for InstaFlowScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::InstaFlow
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let remaining = timestep as f64 / TIME_SCALE;

        Ok(StepResult {
            prev_sample: sample.clone() + model_output.clone() * self.step_size(),
            pred_original: sample + model_output * remaining,
        })
    }

    /// Linear interpolation between data and noise at `t / 1000`.
    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let sigma = (timestep as f64 / TIME_SCALE).clamp(0.0, 1.0);
        noise * sigma + original * (1.0 - sigma)
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }
}
