use burn::tensor::{backend::Backend, Tensor};

use super::{index_of, pred_original_from_sigma, Scheduler, StepIndex, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, PredictionType, SchedulerKind};
use crate::schedule::{NoiseSchedule, SigmaSchedule};
use crate::tensor::NoiseGenerator;

/// Signed square root: negative inputs keep their sign.
fn signed_sqrt(value: f64) -> f64 {
    if value < 0.0 {
        -(value.abs().sqrt())
    } else {
        value.sqrt()
    }
}

/// Splits the move from `sigma_from` to `sigma_to` into a deterministic part and injected noise.
pub fn ancestral_sigmas(sigma_from: f64, sigma_to: f64) -> (f64, f64) {
    if sigma_from <= 0.0 {
        return (sigma_to, 0.0);
    }

    let sigma_up = signed_sqrt(sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2));
    let sigma_down = signed_sqrt(sigma_to.powi(2) - sigma_up.powi(2));

    (sigma_down, sigma_up)
}

#[derive(Debug, Clone)]
pub struct EulerAncestralScheduler {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    prediction: PredictionType,
    step_index: StepIndex,
    noise: NoiseGenerator,
}

impl EulerAncestralScheduler {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(options)?;
        let SigmaSchedule {
            timesteps,
            sigmas,
            init_noise_sigma,
        } = SigmaSchedule::new(&schedule, options);

        Ok(Self {
            timesteps,
            sigmas,
            init_noise_sigma,
            prediction: options.prediction_type,
            step_index: StepIndex::default(),
            noise: NoiseGenerator::new(options.seed),
        })
    }
}

impl<B: Backend> Scheduler<B> for EulerAncestralScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::EulerAncestral
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn input_scale(&self, timestep: usize) -> f64 {
        let sigma = self.sigmas[self.step_index.resolve(&self.timesteps, timestep)];
        (sigma * sigma + 1.0).sqrt()
    }

    fn sigmas(&self) -> Option<&[f64]> {
        Some(&self.sigmas)
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let index = self.step_index.resolve(&self.timesteps, timestep);
        let sigma = self.sigmas[index];
        let (sigma_down, sigma_up) = ancestral_sigmas(sigma, self.sigmas[index + 1]);

        let pred_original = pred_original_from_sigma(model_output, sample.clone(), sigma, self.prediction);
        let derivative = (sample.clone() - pred_original.clone()).div_scalar(sigma);

        let prev_sample = sample.clone() + derivative * (sigma_down - sigma);
        let noise = self.noise.sample(sample.dims(), 1.0, &sample.device());
        let prev_sample = prev_sample + noise * sigma_up;

        self.step_index.advance(index);

        Ok(StepResult {
            prev_sample,
            pred_original,
        })
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let sigma = self.sigmas[index_of(&self.timesteps, timestep)];
        original + noise * sigma
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }
}
